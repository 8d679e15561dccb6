//! Error types for audit operations

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for audit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during audit operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid log path
    #[error("Invalid log path: {path}")]
    InvalidPath { path: PathBuf },

    /// Failed to create log file
    #[error("Failed to create log file: {path}")]
    CreateFailed { path: PathBuf },

    /// Failed to append to log
    #[error("Failed to append to log: {0}")]
    AppendFailed(String),

    /// Log entry is invalid or corrupted
    #[error("Invalid log entry at line {line}: {reason}")]
    InvalidEntry { line: usize, reason: String },

    /// Missing required field in event
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Invalid event type
    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid path error
    pub fn invalid_path<P: Into<PathBuf>>(path: P) -> Self {
        Error::InvalidPath { path: path.into() }
    }

    /// Create a create failed error
    pub fn create_failed<P: Into<PathBuf>>(path: P) -> Self {
        Error::CreateFailed { path: path.into() }
    }

    /// Create an append failed error
    pub fn append_failed<S: Into<String>>(message: S) -> Self {
        Error::AppendFailed(message.into())
    }

    /// Create an invalid entry error
    pub fn invalid_entry(line: usize, reason: &str) -> Self {
        Error::InvalidEntry {
            line,
            reason: reason.to_string(),
        }
    }

    /// Create a missing field error
    pub fn missing_field<S: Into<String>>(field: S) -> Self {
        Error::MissingField {
            field: field.into(),
        }
    }

    /// Create an invalid event type error
    pub fn invalid_event_type<S: Into<String>>(event_type: S) -> Self {
        Error::InvalidEventType(event_type.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_build_expected_variants() {
        assert!(matches!(Error::invalid_path("/nope"), Error::InvalidPath { .. }));
        assert!(matches!(Error::create_failed("/nope"), Error::CreateFailed { .. }));
        assert!(matches!(Error::append_failed("disk full"), Error::AppendFailed(_)));
        assert!(matches!(
            Error::invalid_entry(3, "bad json"),
            Error::InvalidEntry { line: 3, .. }
        ));
        assert!(matches!(Error::missing_field("event"), Error::MissingField { .. }));
        assert!(matches!(
            Error::invalid_event_type("bogus"),
            Error::InvalidEventType(_)
        ));
    }

    #[test]
    fn display_messages_include_context() {
        let e = Error::missing_field("event");
        assert!(e.to_string().contains("event"));
        let e = Error::invalid_entry(7, "truncated");
        assert!(e.to_string().contains('7'));
        assert!(e.to_string().contains("truncated"));
    }
}


//! Append-only audit log of security/operational events.
//!
//! Grounded on [`crate::telemetry`]'s `TelemetryLogger`: a JSON-Lines file,
//! opened in append mode, written behind a mutex-guarded buffered writer.
//! The event shape is generalized from per-transfer events (`job_start`,
//! `window_ok`, ...) to the dotted operational names the job-orchestration
//! core emits (`quota.denied`, `retention.job.delete`, `queue.manager_mode`,
//! `admin.priority_changed`, ...), and `meta` is now a free-form JSON object
//! instead of fixed struct fields, since each event name carries different
//! context.
//!
//! A failed audit write is logged via `tracing::error!` and otherwise
//! swallowed: the log is best-effort and must never fail or block the
//! operation that triggered the event.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A single append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            event: event.into(),
            request_id: None,
            user_id: None,
            job_id: None,
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.meta.insert(key.into(), v);
        }
        self
    }
}

/// Append-only sink for [`AuditEvent`]s. A single writer per process, shared
/// across handlers and background loops via `Arc`.
pub struct AuditLog {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|_| Error::create_failed(path.clone()))?;
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `event` as one JSON line. Never returns an error to the
    /// caller; a write failure is logged and the event is dropped, so a
    /// full disk never blocks job submission, dispatch, or retention.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.try_record(&event) {
            tracing::error!(error = %e, event = %event.event, "audit log write failed");
        }
    }

    fn try_record(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl Clone for AuditLog {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            writer: self.writer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();

        log.record(AuditEvent::new("quota.denied").with_user("user1").with_meta("reason", "daily cap reached"));
        log.record(AuditEvent::new("queue.manager_mode").with_meta("active", "local"));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event, "quota.denied");
        assert_eq!(first.user_id.as_deref(), Some("user1"));
    }

    #[test]
    fn meta_omitted_when_empty() {
        let event = AuditEvent::new("retention.sweep.complete");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"meta\""));
    }
}

//! HTTP error taxonomy: every typed error from `core-jobstate`, `core-queue`,
//! and this crate's own handlers is translated to a status code exactly once,
//! here, at the boundary. Nothing upstream of this file should know about
//! HTTP status codes.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use core_jobstate::quota::QuotaExceededError;
use core_jobstate::upload::UploadError;
use core_jobstate::StateError;
use core_queue::QueueError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("authentication required")]
    Auth(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("bad range: {0}")]
    BadRange(String),

    #[error("quota exceeded: {0}")]
    Quota(QuotaExceededError),

    #[error("service draining")]
    Draining { retry_after_secs: u64 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(m) => ApiError::NotFound(m),
            StateError::Conflict(m) => ApiError::Conflict(m),
            StateError::Validation(m) => ApiError::Validation(m),
            StateError::StorageUnavailable(m) => ApiError::StorageUnavailable(m),
            StateError::Database(e) => ApiError::Database(e),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(m) => ApiError::NotFound(m),
            QueueError::State(e) => e.into(),
            QueueError::LockLost(m) => ApiError::Conflict(format!("lock lost: {m}")),
            QueueError::CoordinatorUnavailable(m) => ApiError::Internal(m),
        }
    }
}

impl From<QuotaExceededError> for ApiError {
    fn from(e: QuotaExceededError) -> Self {
        ApiError::Quota(e)
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::State(e) => e.into(),
            UploadError::Io(e) => ApiError::Io(e),
            UploadError::ChunkOutOfRange { .. } => ApiError::Validation(e.to_string()),
            UploadError::ChunkSizeMismatch { .. } => ApiError::Conflict(e.to_string()),
            UploadError::ChunkChecksumMismatch { .. } => ApiError::Conflict(e.to_string()),
            UploadError::AlreadyCompleted => ApiError::Conflict(e.to_string()),
            UploadError::Incomplete { .. } => ApiError::Conflict(e.to_string()),
            UploadError::FinalChecksumMismatch { .. } => ApiError::Integrity(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", &msg, None),
            ApiError::Auth(_) => json_error(StatusCode::UNAUTHORIZED, "unauthorized", "authentication required", None),
            ApiError::Forbidden(msg) => json_error(StatusCode::FORBIDDEN, "forbidden", &msg, None),
            ApiError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", &msg, None),
            ApiError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", &msg, None),
            ApiError::TooLarge(msg) => json_error(StatusCode::PAYLOAD_TOO_LARGE, "too_large", &msg, None),
            ApiError::BadRange(msg) => json_error(StatusCode::RANGE_NOT_SATISFIABLE, "bad_range", &msg, None),
            ApiError::Quota(e) => {
                let mut resp = json_error(StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", &e.reason, None);
                resp.headers_mut()
                    .insert("Retry-After", HeaderValue::from_static("60"));
                resp
            }
            ApiError::Draining { retry_after_secs } => {
                let mut resp = json_error(StatusCode::SERVICE_UNAVAILABLE, "draining", "service is draining", None);
                if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    resp.headers_mut().insert("Retry-After", v);
                }
                resp
            }
            ApiError::Integrity(msg) => json_error(StatusCode::BAD_REQUEST, "integrity_error", &msg, None),
            ApiError::Jwt(_) => json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid or expired token", None),
            ApiError::Json(_) => json_error(StatusCode::BAD_REQUEST, "invalid_json", "invalid JSON body", None),
            ApiError::Pipeline(msg) => {
                tracing::error!(error = %msg, "pipeline error");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error", None)
            }
            ApiError::Database(e) => {
                tracing::error!(error = %e, "database error");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error", None)
            }
            ApiError::Io(e) => {
                tracing::error!(error = %e, "io error");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error", None)
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error", None)
            }
        }
    }
}

fn json_error(status: StatusCode, code: &str, message: &str, headers: Option<()>) -> Response {
    let _ = headers;
    let body = serde_json::json!({
        "error": message,
        "code": code,
        "status": status.as_u16(),
    });
    (status, axum::Json(body)).into_response()
}

impl From<&str> for ApiError {
    fn from(msg: &str) -> Self {
        ApiError::Internal(msg.to_string())
    }
}

impl From<String> for ApiError {
    fn from(msg: String) -> Self {
        ApiError::Internal(msg)
    }
}

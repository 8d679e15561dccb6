//! Error type shared by every [`crate::QueueBackend`] implementation.

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),
    #[error("job state error: {0}")]
    State(#[from] core_jobstate::StateError),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("lock not held or token mismatch for job {0}")]
    LockLost(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

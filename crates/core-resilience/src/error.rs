//! Shared error type for every primitive in this crate.
//!
//! Pure logic has no I/O of its own to fail, so `ResilienceError` only
//! describes the ways a *protected operation* can fail: the operation itself
//! returned an error (transient or permanent), or the protecting primitive
//! refused to run it (circuit open, pool exhausted, rate limited, timed out).

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    /// The wrapped operation failed in a way that should count toward the
    /// circuit breaker's failure threshold and may succeed on retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The wrapped operation failed in a way that retrying will not fix.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The circuit breaker is open and is fast-failing calls until its
    /// cooldown elapses.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// No pooled connection became available within the configured timeout.
    #[error("pool exhausted, no connection available")]
    PoolExhausted,

    /// An operation did not complete within its allotted duration.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The rate limiter rejected the call; its token bucket is empty.
    #[error("rate limit exceeded")]
    RateLimitExceeded,
}

impl ResilienceError {
    /// Worth retrying with backoff: a fresh attempt might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResilienceError::Transient(_) | ResilienceError::Timeout(_))
    }

    /// Retrying will not change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ResilienceError::Permanent(_))
    }

    /// Counts toward the circuit breaker's failure threshold.
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(self, ResilienceError::CircuitOpen | ResilienceError::RateLimitExceeded)
    }
}

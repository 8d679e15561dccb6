//! Compute Executor: the "Air Gap" pattern.
//!
//! This module provides the boundary between the async orchestration layer
//! and the blocking compute layer. It prevents CPU-intensive steps (sha256
//! verification of a completed upload, manifest hashing) from starving the
//! Tokio runtime.
//!
//! # The Problem
//!
//! CPU-bound operations block the async reactor when called directly from an
//! async task. For JobExecutor this means missed heartbeats and starved SSE
//! progress events for *other* jobs sharing the runtime.
//!
//! # The Solution
//!
//! Use `tokio::task::spawn_blocking` to run compute tasks on a dedicated
//! thread pool, separate from the async reactor threads.
//!
//! # Example
//!
//! ```no_run
//! use core_jobstate::executor::offload_compute;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let result = offload_compute(move || {
//!         expensive_cpu_task()
//!     }).await?;
//!
//!     Ok(())
//! }
//!
//! fn expensive_cpu_task() -> anyhow::Result<u64> {
//!     Ok(42)
//! }
//! ```

use anyhow::Result;
use tokio::task;

/// Offloads a heavy CPU task to a thread where blocking is acceptable.
///
/// This prevents starving the async reactor by running the task on
/// Tokio's blocking thread pool instead of the async worker threads.
///
/// # Example
///
/// ```ignore
/// use core_jobstate::executor::offload_compute;
///
/// let digest = offload_compute(move || {
///     use sha2::{Digest, Sha256};
///     let mut hasher = Sha256::new();
///     hasher.update(&[0u8; 1_000_000]);
///     Ok(hex::encode(hasher.finalize()))
/// }).await?;
/// ```
pub async fn offload_compute<F, T>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(task)
        .await
        .map_err(|join_err| anyhow::anyhow!("compute task panicked: {}", join_err))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    fn mock_heavy_compute() -> Result<u64> {
        let start = std::time::Instant::now();
        let mut n = 0u64;
        while start.elapsed() < Duration::from_millis(100) {
            n = n.wrapping_add(1);
        }
        Ok(n)
    }

    #[tokio::test]
    async fn offload_compute_basic() {
        let result = offload_compute(mock_heavy_compute).await;
        assert!(result.is_ok());
        assert!(result.unwrap() > 0);
    }

    #[tokio::test]
    async fn offload_compute_propagates_error() {
        let result =
            offload_compute(|| -> Result<()> { Err(anyhow::anyhow!("intentional error")) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn async_starvation_prevention() {
        let heartbeat_count = Arc::new(AtomicUsize::new(0));
        let hb_clone = heartbeat_count.clone();

        // Simulates the JobExecutor heartbeat/SSE-keepalive loop for another job.
        let heartbeat_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                hb_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let result = offload_compute(mock_heavy_compute).await;
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(100)).await;

        let count = heartbeat_count.load(Ordering::SeqCst);
        assert!(
            count >= 3,
            "reactor was starved, heartbeats: {}, expected >= 3",
            count
        );

        heartbeat_handle.abort();
    }
}

//! ProgressWriter: asynchronous write-behind for job progress updates.
//!
//! # The Disk Guardian Pattern
//!
//! JobExecutor emits a progress event for every pipeline step (extract audio,
//! transcribe, translate, synthesize, mux) and would otherwise hit the
//! database on every single one. ProgressWriter decouples the executor from
//! write latency by buffering updates and flushing them in batches, rate-
//! limiting how often `StateStore::update_job_progress` is actually called.
//!
//! ## Architecture
//!
//! ```text
//! JobExecutor ──┐
//!               ├──► update_tx ──► ProgressWriter ──► Batch Buffer ──► StateStore
//! JobExecutor ──┤     (fire-and-forget)            ▲
//! JobExecutor ──┘                                    │
//!                                           Disk Guardian task
//!                                           (flushes on size or timer)
//! ```
//!
//! Only the latest update per job is kept in the buffer: progress overwrites
//! are coalesced, so a burst of updates for one job costs one write.
//!
//! # Example
//!
//! ```no_run
//! use core_jobstate::{ProgressWriter, open};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = open("jobs.db").await?;
//!     let (writer, guardian_handle) = ProgressWriter::spawn(store).await?;
//!
//!     writer.update("job-1", 0.5, Some("transcribing"), None, None).await?;
//!
//!     writer.shutdown().await?;
//!     guardian_handle.await??;
//!
//!     Ok(())
//! }
//! ```

use crate::{JobState, StateStore};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct ProgressWriterConfig {
    /// Maximum number of distinct jobs to buffer before flushing.
    pub batch_size: usize,
    /// Maximum time between flushes.
    pub flush_interval: Duration,
    /// Channel capacity for pending updates.
    pub channel_capacity: usize,
}

impl Default for ProgressWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(500),
            channel_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct ProgressUpdate {
    job_id: String,
    progress: f64,
    message: Option<String>,
    state: Option<JobState>,
    error: Option<String>,
}

/// High-level progress writer with asynchronous write-behind.
///
/// Wraps a [`StateStore`] and provides fire-and-forget progress updates that
/// are coalesced and flushed asynchronously by the Disk Guardian task.
pub struct ProgressWriter {
    update_tx: mpsc::Sender<ProgressUpdate>,
    shutdown_tx: Arc<RwLock<Option<tokio::sync::oneshot::Sender<()>>>>,
}

impl ProgressWriter {
    pub async fn spawn(
        store: Arc<dyn StateStore>,
    ) -> Result<(Self, JoinHandle<Result<()>>)> {
        Self::spawn_with_config(store, ProgressWriterConfig::default()).await
    }

    pub async fn spawn_with_config(
        store: Arc<dyn StateStore>,
        config: ProgressWriterConfig,
    ) -> Result<(Self, JoinHandle<Result<()>>)> {
        let (update_tx, update_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let guardian_handle = tokio::spawn(async move {
            run_persistence_loop(store, update_rx, shutdown_rx, config).await
        });

        let writer = Self {
            update_tx,
            shutdown_tx: Arc::new(RwLock::new(Some(shutdown_tx))),
        };

        Ok((writer, guardian_handle))
    }

    /// Send a progress update (fire-and-forget). Buffered and flushed
    /// asynchronously; a burst of updates for the same job coalesces to the
    /// most recent one.
    pub async fn update(
        &self,
        job_id: &str,
        progress: f64,
        message: Option<&str>,
        state: Option<JobState>,
        error: Option<&str>,
    ) -> Result<()> {
        let update = ProgressUpdate {
            job_id: job_id.to_string(),
            progress,
            message: message.map(str::to_string),
            state,
            error: error.map(str::to_string),
        };

        self.update_tx
            .send(update)
            .await
            .map_err(|_| anyhow::anyhow!("progress writer guardian task has stopped"))?;

        Ok(())
    }

    /// Signal the Disk Guardian to flush all pending updates and stop.
    /// Callers should await the guardian handle to ensure everything is
    /// persisted before process exit.
    pub async fn shutdown(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.write().await;
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(());
            info!("progress writer shutdown signal sent");
        }
        Ok(())
    }
}

async fn run_persistence_loop(
    store: Arc<dyn StateStore>,
    mut update_rx: mpsc::Receiver<ProgressUpdate>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    config: ProgressWriterConfig,
) -> Result<()> {
    let mut buffer: HashMap<String, ProgressUpdate> = HashMap::with_capacity(config.batch_size);
    let mut flush_timer = tokio::time::interval(config.flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        batch_size = config.batch_size,
        flush_interval_ms = config.flush_interval.as_millis(),
        "progress writer disk guardian started"
    );

    loop {
        tokio::select! {
            Some(update) = update_rx.recv() => {
                buffer.insert(update.job_id.clone(), update);

                if buffer.len() >= config.batch_size {
                    flush_updates(&store, &mut buffer).await;
                }
            }

            _ = flush_timer.tick() => {
                if !buffer.is_empty() {
                    flush_updates(&store, &mut buffer).await;
                }
            }

            _ = &mut shutdown_rx => {
                info!(pending_updates = buffer.len(), "progress writer shutdown signal received");

                while let Ok(update) = update_rx.try_recv() {
                    buffer.insert(update.job_id.clone(), update);
                }

                if !buffer.is_empty() {
                    flush_updates(&store, &mut buffer).await;
                }

                info!("progress writer stopped gracefully");
                break;
            }
        }
    }

    Ok(())
}

async fn flush_updates(store: &Arc<dyn StateStore>, buffer: &mut HashMap<String, ProgressUpdate>) {
    if buffer.is_empty() {
        return;
    }

    let count = buffer.len();
    debug!(count, "flushing progress updates to state store");

    for (job_id, update) in buffer.drain() {
        if let Err(e) = store
            .update_job_progress(
                &job_id,
                update.progress,
                update.message.as_deref(),
                update.state,
                update.error.as_deref(),
            )
            .await
        {
            error!(job_id, error = %e, "failed to flush progress update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Job, JobFilter, StateError, StateResult, UploadSession, UserQuotaOverride};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockStore {
        jobs: StdMutex<HashMap<String, Job>>,
    }

    #[async_trait]
    impl StateStore for MockStore {
        async fn put_job(&self, job: &Job) -> StateResult<()> {
            self.jobs.lock().unwrap().insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn get_job(&self, id: &str) -> StateResult<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn list_jobs(&self, _limit: usize, _filter: &JobFilter) -> StateResult<Vec<Job>> {
            Ok(self.jobs.lock().unwrap().values().cloned().collect())
        }

        async fn delete_job(&self, id: &str) -> StateResult<()> {
            self.jobs.lock().unwrap().remove(id);
            Ok(())
        }

        async fn update_job_progress(
            &self,
            job_id: &str,
            progress: f64,
            message: Option<&str>,
            state: Option<JobState>,
            error: Option<&str>,
        ) -> StateResult<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| StateError::NotFound(job_id.to_string()))?;
            job.progress = progress;
            if let Some(m) = message {
                job.message = Some(m.to_string());
            }
            if let Some(s) = state {
                job.state = s;
            }
            if let Some(e) = error {
                job.error = Some(e.to_string());
            }
            Ok(())
        }

        async fn put_idempotency(&self, _key: &str, _job_id: &str) -> StateResult<()> {
            Ok(())
        }

        async fn get_idempotency(&self, _key: &str) -> StateResult<Option<(String, DateTime<Utc>)>> {
            Ok(None)
        }

        async fn put_upload(&self, _upload: &UploadSession) -> StateResult<()> {
            Ok(())
        }

        async fn get_upload(&self, _id: &str) -> StateResult<Option<UploadSession>> {
            Ok(None)
        }

        async fn delete_upload(&self, _id: &str) -> StateResult<()> {
            Ok(())
        }

        async fn list_uploads(
            &self,
            _owner: Option<&str>,
            _include_completed: bool,
        ) -> StateResult<Vec<UploadSession>> {
            Ok(Vec::new())
        }

        async fn get_user_quota(&self, _user_id: &str) -> StateResult<Option<UserQuotaOverride>> {
            Ok(None)
        }

        async fn upsert_user_quota(
            &self,
            _user_id: &str,
            _overrides: &UserQuotaOverride,
        ) -> StateResult<()> {
            Ok(())
        }

        async fn get_user_storage_bytes(&self, _user_id: &str) -> StateResult<u64> {
            Ok(0)
        }
    }

    fn sample_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            owner_id: "user1".into(),
            video_path: "/tmp/in.mp4".into(),
            duration_s: None,
            mode: crate::Mode::Medium,
            device: crate::Device::Auto,
            state: JobState::Running,
            progress: 0.0,
            message: None,
            error: None,
            visibility: crate::Visibility::Private,
            runtime: serde_json::Map::new(),
            library: crate::LibraryMetadata::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn progress_writer_flushes_on_shutdown() {
        let store: Arc<dyn StateStore> = Arc::new(MockStore::default());
        store.put_job(&sample_job("job-1")).await.unwrap();

        let (writer, handle) = ProgressWriter::spawn(store.clone()).await.unwrap();

        writer
            .update("job-1", 0.5, Some("transcribing"), None, None)
            .await
            .unwrap();

        writer.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();

        let job = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.progress, 0.5);
        assert_eq!(job.message.as_deref(), Some("transcribing"));
    }

    #[tokio::test]
    async fn progress_writer_coalesces_bursts_for_same_job() {
        let store: Arc<dyn StateStore> = Arc::new(MockStore::default());
        store.put_job(&sample_job("job-1")).await.unwrap();

        let config = ProgressWriterConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(10),
            channel_capacity: 100,
        };
        let (writer, handle) = ProgressWriter::spawn_with_config(store.clone(), config)
            .await
            .unwrap();

        for i in 1..=5 {
            writer
                .update("job-1", i as f64 / 5.0, None, None, None)
                .await
                .unwrap();
        }

        writer.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();

        let job = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.progress, 1.0);
    }
}

//! JobExecutor: the per-worker claim -> before-run -> run-stages -> after-run
//! loop that actually dispatches dubbing jobs.
//!
//! Grounded on `reactor.rs`'s `Reactor::run`: the same claim-then-spawn-
//! isolated-worker shape, and the same `tokio::select!` between a shared
//! `Notify` (woken by the API on submission) and a heartbeat sleep when
//! idle. Differs from the teacher in two ways: the claim step goes through
//! `core_queue::QueueBackend::claim()` instead of a direct SQL transaction
//! (so the same loop works against both `LocalQueue` and `DistributedQueue`),
//! and `execute_transfer`'s `simulate_transfer` placeholder is replaced by a
//! `DubbingPipeline` trait object — the actual ASR/translation/TTS/muxing
//! stages are an external collaborator this module never touches directly.

use core_jobstate::{JobState, ProgressWriter, Role, StateStore};
use core_queue::QueueBackend;
use orbit_core_audit::{AuditEvent, AuditLog};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::state::{JobEvent, JobEventBus};

/// How a [`DubbingPipeline`] run ended. Distinguished from a plain
/// `Result<(), E>` so cooperative cancellation (observed between stages, per
/// the claim/run/release cycle's cancellation-check point) doesn't have to be
/// encoded as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Canceled,
}

/// Cheap, repeatable check for whether a running job has been asked to stop.
/// Passed into [`DubbingPipeline::run`] so a stage boundary can abort
/// gracefully instead of the executor forcing termination.
pub struct CancellationCheck {
    store: Arc<dyn StateStore>,
    job_id: String,
}

impl CancellationCheck {
    pub async fn is_canceled(&self) -> bool {
        matches!(
            self.store.get_job(&self.job_id).await,
            Ok(Some(job)) if job.state == JobState::Canceled
        )
    }
}

/// The opaque external pipeline: extract audio, transcribe, translate,
/// synthesize, mux. `JobExecutor`'s job stops at orchestrating whatever
/// stream of progress events and final result this collaborator produces;
/// it does not know or care how a stage is implemented. Must tolerate redo
/// (at-least-once claim semantics mean a crashed worker's job is reclaimed).
#[async_trait::async_trait]
pub trait DubbingPipeline: Send + Sync {
    async fn run(
        &self,
        job_id: &str,
        progress: &ProgressWriter,
        cancel: &CancellationCheck,
    ) -> anyhow::Result<PipelineOutcome>;
}

/// Placeholder pipeline standing in for the real ASR/translation/TTS/mux
/// stack (an external collaborator, out of scope here). Exercises the same
/// shape a real implementation would: staged progress, a cancellation check
/// between stages, and a CPU-bound step (checksum) offloaded via
/// `core_jobstate::executor::offload_compute` so it can't starve other
/// workers' heartbeats.
pub struct PlaceholderDubbingPipeline;

const STAGES: &[(&str, f64)] = &[
    ("extract_audio", 0.15),
    ("transcribe", 0.45),
    ("translate", 0.65),
    ("synthesize", 0.9),
    ("mux", 1.0),
];

#[async_trait::async_trait]
impl DubbingPipeline for PlaceholderDubbingPipeline {
    async fn run(
        &self,
        job_id: &str,
        progress: &ProgressWriter,
        cancel: &CancellationCheck,
    ) -> anyhow::Result<PipelineOutcome> {
        for (stage, fraction) in STAGES {
            if cancel.is_canceled().await {
                return Ok(PipelineOutcome::Canceled);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;

            if *stage == "mux" {
                // Stand-in CPU-bound step: verify the job id's checksum
                // representation off the async reactor, the same way a real
                // mux stage would hash the final container.
                let id = job_id.to_string();
                core_jobstate::executor::offload_compute(move || {
                    use sha2::{Digest, Sha256};
                    let mut hasher = Sha256::new();
                    hasher.update(id.as_bytes());
                    Ok(hex::encode(hasher.finalize()))
                })
                .await?;
            }

            progress.update(job_id, *fraction, Some(stage), None, None).await?;
        }

        Ok(PipelineOutcome::Completed)
    }
}

/// One worker slot: claims jobs off the queue and runs them through a
/// [`DubbingPipeline`] to completion, failure, or cancellation.
pub struct JobExecutor {
    worker_id: usize,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn QueueBackend>,
    user_pool: SqlitePool,
    audit: AuditLog,
    events: JobEventBus,
    pipeline: Arc<dyn DubbingPipeline>,
    notify: Arc<Notify>,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn QueueBackend>,
        user_pool: SqlitePool,
        audit: AuditLog,
        events: JobEventBus,
        pipeline: Arc<dyn DubbingPipeline>,
        notify: Arc<Notify>,
    ) -> Self {
        Self { worker_id, store, queue, user_pool, audit, events, pipeline, notify }
    }

    /// Spawns `count` workers sharing one `notify` so a single submission
    /// wakes exactly the workers currently idle, not a fixed one.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_pool(
        count: usize,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn QueueBackend>,
        user_pool: SqlitePool,
        audit: AuditLog,
        events: JobEventBus,
        pipeline: Arc<dyn DubbingPipeline>,
        notify: Arc<Notify>,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker_id| {
                let executor = JobExecutor::new(
                    worker_id,
                    store.clone(),
                    queue.clone(),
                    user_pool.clone(),
                    audit.clone(),
                    events.clone(),
                    pipeline.clone(),
                    notify.clone(),
                );
                tokio::spawn(executor.run())
            })
            .collect()
    }

    pub async fn run(self) {
        info!(worker_id = self.worker_id, "job executor worker started");

        loop {
            match self.queue.claim().await {
                Ok(Some(job_id)) => {
                    debug!(worker_id = self.worker_id, job_id, "claimed job");

                    let store = self.store.clone();
                    let queue = self.queue.clone();
                    let user_pool = self.user_pool.clone();
                    let audit = self.audit.clone();
                    let events = self.events.clone();
                    let pipeline = self.pipeline.clone();
                    let worker_id = self.worker_id;

                    tokio::spawn(async move {
                        Self::execute_job(store, queue, user_pool, audit, events, pipeline, worker_id, job_id).await;
                    });
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.notify.notified() => {
                            trace!(worker_id = self.worker_id, "woken by job submission");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            trace!(worker_id = self.worker_id, "heartbeat");
                        }
                    }
                }
                Err(e) => {
                    error!(worker_id = self.worker_id, error = %e, "queue claim failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    #[instrument(skip(store, queue, user_pool, audit, events, pipeline), fields(job_id = %job_id, worker_id))]
    async fn execute_job(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn QueueBackend>,
        user_pool: SqlitePool,
        audit: AuditLog,
        events: JobEventBus,
        pipeline: Arc<dyn DubbingPipeline>,
        worker_id: usize,
        job_id: String,
    ) {
        let Ok(Some(job)) = store.get_job(&job_id).await else {
            warn!(job_id, "claimed job vanished before dispatch");
            return;
        };

        let role = lookup_role(&user_pool, &job.owner_id).await;

        match queue.before_job_run(&job_id, Some(job.owner_id.as_str()), role).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id, "before_job_run declined dispatch, leaving job pending");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "before_job_run failed");
                return;
            }
        }

        if let Err(e) = store
            .update_job_progress(&job_id, 0.0, Some("started"), Some(JobState::Running), None)
            .await
        {
            error!(job_id, error = %e, "failed to mark job running");
        }
        events.publish(JobEvent {
            job_id: job_id.clone(),
            state: JobState::Running.to_string(),
            progress: 0.0,
            message: Some("started".into()),
        });

        let (writer, guardian) = match ProgressWriter::spawn(store.clone()).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(job_id, error = %e, "failed to start progress writer");
                let _ = queue
                    .after_job_run(&job_id, Some(job.owner_id.as_str()), JobState::Failed, false, Some("internal error"))
                    .await;
                return;
            }
        };

        let cancel = CancellationCheck { store: store.clone(), job_id: job_id.clone() };
        let outcome = pipeline.run(&job_id, &writer, &cancel).await;

        if let Err(e) = writer.shutdown().await {
            warn!(job_id, error = %e, "progress writer shutdown signal failed");
        }
        if let Err(e) = guardian.await {
            warn!(job_id, error = %e, "progress writer guardian task panicked");
        }

        let existing_progress = store.get_job(&job_id).await.ok().flatten().map(|j| j.progress).unwrap_or(0.0);

        let (final_state, ok, error_message, final_progress) = final_outcome(outcome, existing_progress);

        if let Err(e) = store
            .update_job_progress(&job_id, final_progress, None, Some(final_state), error_message.as_deref())
            .await
        {
            error!(job_id, error = %e, "failed to persist final job state");
        }

        events.publish(JobEvent {
            job_id: job_id.clone(),
            state: final_state.to_string(),
            progress: final_progress,
            message: error_message.clone(),
        });

        audit.record(
            AuditEvent::new("job.finished")
                .with_user(job.owner_id.clone())
                .with_job(job_id.clone())
                .with_meta("state", final_state.to_string())
                .with_meta("worker_id", worker_id),
        );

        if let Err(e) = queue.after_job_run(&job_id, Some(job.owner_id.as_str()), final_state, ok, error_message.as_deref()).await {
            error!(job_id, error = %e, "after_job_run failed");
        }
    }
}

/// Maps a finished pipeline run to the `(state, ok, error_message, progress)`
/// tuple persisted to the `StateStore` and passed to `after_job_run`.
/// `existing_progress` is preserved on cancel/failure rather than reset,
/// so a canceled-at-65% job still reports 65% rather than regressing to 0.
fn final_outcome(
    outcome: anyhow::Result<PipelineOutcome>,
    existing_progress: f64,
) -> (JobState, bool, Option<String>, f64) {
    match outcome {
        Ok(PipelineOutcome::Completed) => (JobState::Done, true, None, 1.0),
        Ok(PipelineOutcome::Canceled) => (JobState::Canceled, false, None, existing_progress),
        Err(e) => (JobState::Failed, false, Some(e.to_string()), existing_progress),
    }
}

async fn lookup_role(pool: &SqlitePool, user_id: &str) -> Role {
    sqlx::query_scalar::<_, String>("SELECT role FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
        .and_then(|r| r.parse().ok())
        .unwrap_or(Role::Viewer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_outcome_reports_full_progress() {
        let (state, ok, err, progress) = final_outcome(Ok(PipelineOutcome::Completed), 0.65);
        assert_eq!(state, JobState::Done);
        assert!(ok);
        assert!(err.is_none());
        assert_eq!(progress, 1.0);
    }

    #[test]
    fn canceled_outcome_preserves_progress_at_cancellation_point() {
        let (state, ok, err, progress) = final_outcome(Ok(PipelineOutcome::Canceled), 0.65);
        assert_eq!(state, JobState::Canceled);
        assert!(!ok);
        assert!(err.is_none());
        assert_eq!(progress, 0.65);
    }

    #[test]
    fn failed_outcome_carries_error_message_and_last_progress() {
        let (state, ok, err, progress) = final_outcome(Err(anyhow::anyhow!("pipeline blew up")), 0.3);
        assert_eq!(state, JobState::Failed);
        assert!(!ok);
        assert_eq!(err.as_deref(), Some("pipeline blew up"));
        assert_eq!(progress, 0.3);
    }
}

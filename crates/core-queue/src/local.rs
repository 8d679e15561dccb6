//! [`LocalQueue`]: in-process fallback queue with no cross-process locking.
//!
//! Grounded on `queue/fallback_local_queue.py`'s `FallbackLocalQueue`: a
//! bounded scan of [`StateStore`] for `QUEUED` jobs, a short-lived "seen" set
//! to avoid resubmitting the same job every scan tick, and before-run guards
//! reduced to a policy check (no distributed lock needed since this backend
//! is only active when it is the sole writer).

use crate::backend::{
    AdminJobSummary, AdminSnapshot, Counts, QueueBackend, QueueMode, QueueStatus, UserQuotaCounts,
};
use crate::error::QueueResult;
use crate::policy::{GlobalLimits, Operation, PolicyEngine, PolicyRequest};
use async_trait::async_trait;
use core_jobstate::{Device, JobFilter, JobState, Mode, Role, StateStore};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::instrument;

pub struct LocalQueue {
    store: Arc<dyn StateStore>,
    policy: PolicyEngine,
    seen: Mutex<HashSet<String>>,
    canceled: Mutex<HashSet<String>>,
    notify: Notify,
}

impl LocalQueue {
    pub fn new(store: Arc<dyn StateStore>, limits: GlobalLimits) -> Self {
        Self {
            store,
            policy: PolicyEngine::new(limits),
            seen: Mutex::new(HashSet::new()),
            canceled: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Wakes a waiting [`QueueBackend::claim`] caller early, e.g. right after
    /// a submission.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub async fn wait_for_notify_or(&self, timeout: std::time::Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

#[async_trait]
impl QueueBackend for LocalQueue {
    fn status(&self) -> QueueStatus {
        QueueStatus {
            mode: QueueMode::Local,
            coordinator_configured: false,
            coordinator_healthy: false,
            detail: "fallback local queue active".to_string(),
            banner: Some("Coordinator unavailable; using fallback queue".to_string()),
        }
    }

    async fn start(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn stop(&self) -> QueueResult<()> {
        self.seen.lock().await.clear();
        Ok(())
    }

    #[instrument(skip(self, _meta))]
    async fn submit_job(
        &self,
        job_id: &str,
        _user_id: &str,
        _mode: Mode,
        _device: Device,
        _priority: i64,
        _meta: std::collections::HashMap<String, String>,
    ) -> QueueResult<()> {
        // Job row is already persisted by the caller (StateStore is the
        // source of truth); this backend only needs to stop treating it as
        // "already seen" so the scan loop picks it up immediately.
        self.seen.lock().await.remove(job_id);
        self.notify();
        Ok(())
    }

    async fn cancel_job(&self, job_id: &str, _user_id: Option<&str>) -> QueueResult<()> {
        self.canceled.lock().await.insert(job_id.to_string());
        Ok(())
    }

    async fn user_counts(&self, user_id: &str) -> QueueResult<Counts> {
        let jobs = self.store.list_jobs(2000, &JobFilter { owner_id: Some(user_id.to_string()), state: None }).await?;
        let running = jobs.iter().filter(|j| j.state == JobState::Running).count() as u64;
        let queued = jobs.iter().filter(|j| j.state == JobState::Queued).count() as u64;
        Ok(Counts { running, queued })
    }

    async fn user_quota(&self, _user_id: &str) -> QueueResult<Option<UserQuotaCounts>> {
        Ok(None)
    }

    async fn admin_snapshot(&self, limit: usize) -> QueueResult<AdminSnapshot> {
        let jobs = self.store.list_jobs(limit, &JobFilter::default()).await?;
        let items = jobs
            .into_iter()
            .map(|j| AdminJobSummary {
                job_id: j.id,
                user_id: j.owner_id,
                mode: j.mode.to_string(),
                state: j.state.to_string(),
                priority: None,
            })
            .collect();
        Ok(AdminSnapshot { mode: QueueMode::Local, items })
    }

    async fn admin_set_priority(&self, _job_id: &str, _priority: i64) -> QueueResult<bool> {
        // Priority control is not supported in the local fallback queue.
        Ok(false)
    }

    async fn admin_set_user_quotas(
        &self,
        _user_id: &str,
        _max_running: Option<i64>,
        _max_queued: Option<i64>,
    ) -> QueueResult<UserQuotaCounts> {
        Ok(UserQuotaCounts::default())
    }

    async fn global_counts(&self) -> QueueResult<Counts> {
        let jobs = self.store.list_jobs(5000, &JobFilter::default()).await?;
        let running = jobs.iter().filter(|j| j.state == JobState::Running).count() as u64;
        let queued = jobs.iter().filter(|j| j.state == JobState::Queued).count() as u64;
        Ok(Counts { running, queued })
    }

    #[instrument(skip(self))]
    async fn before_job_run(&self, job_id: &str, user_id: Option<&str>, role: Role) -> QueueResult<bool> {
        if self.canceled.lock().await.remove(job_id) {
            return Ok(false);
        }

        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Ok(false);
        };

        let uid = user_id.unwrap_or_default();
        let user_counts = self.user_counts(uid).await?;
        let global_counts = self.global_counts().await?;
        let (global_high_running, user_jobs_today) = crate::backend::policy_counters(self.store.as_ref(), uid).await?;
        let decision = self.policy.evaluate(&PolicyRequest {
            user_id: uid,
            role,
            requested_mode: job.mode,
            requested_device: job.device,
            operation: Operation::Dispatch,
            user_running: user_counts.running as i64,
            user_queued: user_counts.queued as i64,
            user_jobs_today,
            global_running: global_counts.running as i64,
            global_high_running,
            user_quota: None,
            draining: false,
        });

        if !decision.ok {
            return Ok(false);
        }

        if job.mode != decision.effective_mode || job.device != decision.effective_device {
            job.mode = decision.effective_mode;
            job.device = decision.effective_device;
            self.store.put_job(&job).await?;
        }

        Ok(true)
    }

    async fn after_job_run(
        &self,
        _job_id: &str,
        _user_id: Option<&str>,
        _final_state: JobState,
        _ok: bool,
        _error: Option<&str>,
    ) -> QueueResult<()> {
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim(&self) -> QueueResult<Option<String>> {
        let jobs = self.store.list_jobs(250, &JobFilter { owner_id: None, state: Some(JobState::Queued) }).await?;
        let mut seen = self.seen.lock().await;
        for job in jobs {
            if !seen.contains(&job.id) {
                seen.insert(job.id.clone());
                return Ok(Some(job.id));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_jobstate::{SqliteStateStore, Visibility};

    async fn store() -> (Arc<dyn StateStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStateStore::open(dir.path().join("jobs.db").to_str().unwrap()).await.unwrap());
        (store, dir)
    }

    fn job(id: &str, state: JobState) -> core_jobstate::Job {
        let now = Utc::now();
        core_jobstate::Job {
            id: id.to_string(),
            owner_id: "user1".to_string(),
            video_path: "in.mp4".to_string(),
            duration_s: None,
            mode: Mode::Medium,
            device: Device::Auto,
            state,
            progress: 0.0,
            message: None,
            error: None,
            visibility: Visibility::Private,
            runtime: Default::default(),
            library: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn claim_returns_each_queued_job_once() {
        let (store, _dir) = store().await;
        store.put_job(&job("job-1", JobState::Queued)).await.unwrap();
        let queue = LocalQueue::new(store, GlobalLimits::default());
        assert_eq!(queue.claim().await.unwrap(), Some("job-1".to_string()));
        assert_eq!(queue.claim().await.unwrap(), None);
    }

    #[tokio::test]
    async fn submit_clears_seen_so_resubmission_is_claimable_again() {
        let (store, _dir) = store().await;
        store.put_job(&job("job-1", JobState::Queued)).await.unwrap();
        let queue = LocalQueue::new(store, GlobalLimits::default());
        queue.claim().await.unwrap();
        assert_eq!(queue.claim().await.unwrap(), None);
        queue.submit_job("job-1", "user1", Mode::Medium, Device::Auto, 100, Default::default()).await.unwrap();
        assert_eq!(queue.claim().await.unwrap(), Some("job-1".to_string()));
    }

    #[tokio::test]
    async fn before_job_run_refuses_canceled_job() {
        let (store, _dir) = store().await;
        store.put_job(&job("job-1", JobState::Queued)).await.unwrap();
        let queue = LocalQueue::new(store, GlobalLimits::default());
        queue.cancel_job("job-1", None).await.unwrap();
        let ok = queue.before_job_run("job-1", Some("user1"), Role::Operator).await.unwrap();
        assert!(!ok);
    }
}

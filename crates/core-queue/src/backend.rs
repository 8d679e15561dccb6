//! [`QueueBackend`]: the single interface the HTTP layer and
//! [`crate::AutoQueue`]'s two implementations both speak.
//!
//! Grounded on `queue/interfaces.py`'s `QueueBackend` Protocol in the
//! original source: the same operation set, translated to an async trait.

use crate::error::QueueResult;
use async_trait::async_trait;
use core_jobstate::{JobFilter, JobState, Mode, Role, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Distributed,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub mode: QueueMode,
    pub coordinator_configured: bool,
    pub coordinator_healthy: bool,
    pub detail: String,
    pub banner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counts {
    pub running: u64,
    pub queued: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminJobSummary {
    pub job_id: String,
    pub user_id: String,
    pub mode: String,
    pub state: String,
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSnapshot {
    pub mode: QueueMode,
    pub items: Vec<AdminJobSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserQuotaCounts {
    pub max_running: Option<i64>,
    pub max_queued: Option<i64>,
}

/// Uniform queue surface: submit, cancel, the claim-adjacent before/after
/// run hooks, counters, and admin operations. Implemented by
/// [`crate::DistributedQueue`], [`crate::LocalQueue`], and composed by
/// [`crate::AutoQueue`].
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn status(&self) -> QueueStatus;

    async fn start(&self) -> QueueResult<()>;
    async fn stop(&self) -> QueueResult<()>;

    async fn submit_job(
        &self,
        job_id: &str,
        user_id: &str,
        mode: Mode,
        device: core_jobstate::Device,
        priority: i64,
        meta: HashMap<String, String>,
    ) -> QueueResult<()>;

    async fn cancel_job(&self, job_id: &str, user_id: Option<&str>) -> QueueResult<()>;

    async fn user_counts(&self, user_id: &str) -> QueueResult<Counts>;
    async fn user_quota(&self, user_id: &str) -> QueueResult<Option<UserQuotaCounts>>;

    async fn admin_snapshot(&self, limit: usize) -> QueueResult<AdminSnapshot>;
    async fn admin_set_priority(&self, job_id: &str, priority: i64) -> QueueResult<bool>;
    async fn admin_set_user_quotas(
        &self,
        user_id: &str,
        max_running: Option<i64>,
        max_queued: Option<i64>,
    ) -> QueueResult<UserQuotaCounts>;

    async fn global_counts(&self) -> QueueResult<Counts>;

    /// Called by a worker immediately before running a claimed job. Must
    /// return `true` only if the job may proceed now.
    async fn before_job_run(&self, job_id: &str, user_id: Option<&str>, role: Role) -> QueueResult<bool>;

    async fn after_job_run(
        &self,
        job_id: &str,
        user_id: Option<&str>,
        final_state: core_jobstate::JobState,
        ok: bool,
        error: Option<&str>,
    ) -> QueueResult<()>;

    /// Pull the next runnable job id, if any. Used by [`crate::JobExecutor`]'s
    /// claim loop (not part of the original Python interface, which instead
    /// pushes into a callback-driven scheduler; this core pulls instead,
    /// matching `api-server`'s worker-loop shape).
    async fn claim(&self) -> QueueResult<Option<String>>;
}

/// Counters [`crate::policy::PolicyEngine::evaluate`] needs for its mode-
/// gating and daily-cap rules that neither backend's own `user_counts`/
/// `global_counts` track: how many `High`-mode jobs are running globally, and
/// how many jobs this user has submitted so far today (UTC). Shared between
/// [`crate::DistributedQueue`] and [`crate::LocalQueue`] since both read the
/// same [`StateStore`] as their source of truth for job rows.
pub(crate) async fn policy_counters(store: &dyn StateStore, user_id: &str) -> QueueResult<(i64, i64)> {
    let today = chrono::Utc::now().date_naive();

    let global = store.list_jobs(usize::MAX, &JobFilter::default()).await?;
    let global_high_running = global.iter().filter(|j| j.state == JobState::Running && j.mode == Mode::High).count() as i64;

    let owned = store.list_jobs(usize::MAX, &JobFilter { owner_id: Some(user_id.to_string()), state: None }).await?;
    let user_jobs_today = owned.iter().filter(|j| j.created_at.date_naive() == today).count() as i64;

    Ok((global_high_running, user_jobs_today))
}

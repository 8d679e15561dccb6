//! [`DistributedQueue`]: a [`KeyedCoordinator`]-backed [`QueueBackend`].
//!
//! Grounded on `queue/manager.py`'s Redis-backed path and on the key schema
//! in SPEC_FULL.md §4.4 (`…:queue:pending`, `…:queue:delayed`,
//! `…:job:{id}:lock`, and friends). `claim` peeks the top of `pending` with
//! `zrange_by_score` and only `zrem`s it once `set_nx` on the job's lock key
//! actually succeeds, so a lock-acquisition race leaves the job in `pending`
//! for the next worker instead of dropping it, per §4.4's invariant that a
//! job is always in exactly one of `pending`, `delayed`, or `running`.

use crate::backend::{
    AdminJobSummary, AdminSnapshot, Counts, QueueBackend, QueueMode, QueueStatus, UserQuotaCounts,
};
use crate::coordinator::KeyedCoordinator;
use crate::error::{QueueError, QueueResult};
use crate::policy::{GlobalLimits, Operation, PolicyEngine, PolicyRequest};
use async_trait::async_trait;
use core_jobstate::{Device, JobState, Mode, Role, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DistributedQueueConfig {
    pub key_prefix: String,
    pub lock_ttl: Duration,
    pub lock_refresh_interval: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_cap: Duration,
}

impl Default for DistributedQueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "dubbing".to_string(),
            lock_ttl: Duration::from_millis(30_000),
            lock_refresh_interval: Duration::from_millis(10_000),
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

pub struct DistributedQueue {
    coordinator: Arc<dyn KeyedCoordinator>,
    store: Arc<dyn StateStore>,
    config: DistributedQueueConfig,
    policy: PolicyEngine,
    held_locks: Mutex<HashMap<String, (String, JoinHandle<()>)>>,
}

impl DistributedQueue {
    pub fn new(coordinator: Arc<dyn KeyedCoordinator>, store: Arc<dyn StateStore>, config: DistributedQueueConfig) -> Self {
        Self::with_limits(coordinator, store, config, GlobalLimits::default())
    }

    pub fn with_limits(
        coordinator: Arc<dyn KeyedCoordinator>,
        store: Arc<dyn StateStore>,
        config: DistributedQueueConfig,
        limits: GlobalLimits,
    ) -> Self {
        Self {
            coordinator,
            store,
            config,
            policy: PolicyEngine::new(limits),
            held_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.config.key_prefix, suffix)
    }

    fn job_key(&self, job_id: &str, suffix: &str) -> String {
        format!("{}:job:{}:{}", self.config.key_prefix, job_id, suffix)
    }

    fn user_key(&self, user_id: &str, suffix: &str) -> String {
        format!("{}:user:{}:{}", self.config.key_prefix, user_id, suffix)
    }

    fn now_secs() -> f64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }

    #[instrument(skip(self))]
    async fn defer_with_backoff(&self, job_id: &str, priority: i64) -> QueueResult<()> {
        let meta_key = self.job_key(job_id, "meta");
        let attempts: u32 = self
            .coordinator
            .hget(&meta_key, "attempts")
            .await
            .map_err(|e| QueueError::CoordinatorUnavailable(e.to_string()))?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
            + 1;
        self.coordinator
            .hset(&meta_key, "attempts", &attempts.to_string())
            .await
            .map_err(|e| QueueError::CoordinatorUnavailable(e.to_string()))?;

        if attempts > self.config.max_attempts {
            self.coordinator
                .zadd(&self.key("queue:dlq"), &format!("{job_id}|exhausted"), Self::now_secs())
                .await
                .map_err(|e| QueueError::CoordinatorUnavailable(e.to_string()))?;
            warn!(job_id, attempts, "job exceeded max attempts, routed to dead-letter");
            return Ok(());
        }

        let backoff = self
            .config
            .base_backoff
            .mul_f64(2f64.powi(attempts as i32 - 1))
            .min(self.config.backoff_cap);
        let due_at = Self::now_secs() + backoff.as_secs_f64();
        self.coordinator
            .zadd(&self.key("queue:delayed"), job_id, due_at)
            .await
            .map_err(|e| QueueError::CoordinatorUnavailable(e.to_string()))?;
        let _ = priority;
        Ok(())
    }

    /// Moves due delayed jobs back onto the pending queue. Intended to be
    /// driven by a background loop ticking roughly once a second.
    pub async fn run_delayed_mover_once(&self) -> QueueResult<()> {
        let due = self
            .coordinator
            .zrange_by_score(&self.key("queue:delayed"), Self::now_secs())
            .await
            .map_err(|e| QueueError::CoordinatorUnavailable(e.to_string()))?;
        for item in due {
            self.coordinator
                .zrem(&self.key("queue:delayed"), &item.member)
                .await
                .map_err(|e| QueueError::CoordinatorUnavailable(e.to_string()))?;
            let priority = self
                .coordinator
                .hget(&self.job_key(&item.member, "meta"), "priority")
                .await
                .map_err(|e| QueueError::CoordinatorUnavailable(e.to_string()))?
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(100.0);
            self.coordinator
                .zadd(&self.key("queue:pending"), &item.member, priority)
                .await
                .map_err(|e| QueueError::CoordinatorUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    fn spawn_lock_refresh(&self, job_id: &str, token: String) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let lock_key = self.job_key(job_id, "lock");
        let ttl = self.config.lock_ttl;
        let interval = self.config.lock_refresh_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match coordinator.expire_if(&lock_key, &token, ttl).await {
                    Ok(true) => continue,
                    _ => break,
                }
            }
        })
    }
}

#[async_trait]
impl QueueBackend for DistributedQueue {
    fn status(&self) -> QueueStatus {
        QueueStatus {
            mode: QueueMode::Distributed,
            coordinator_configured: true,
            coordinator_healthy: true,
            detail: "distributed queue active".to_string(),
            banner: None,
        }
    }

    async fn start(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn stop(&self) -> QueueResult<()> {
        let mut locks = self.held_locks.lock().await;
        for (_, (_, handle)) in locks.drain() {
            handle.abort();
        }
        Ok(())
    }

    #[instrument(skip(self, meta))]
    async fn submit_job(
        &self,
        job_id: &str,
        user_id: &str,
        mode: Mode,
        device: Device,
        priority: i64,
        meta: HashMap<String, String>,
    ) -> QueueResult<()> {
        let meta_key = self.job_key(job_id, "meta");
        self.coordinator.hset(&meta_key, "job_id", job_id).await.map_err(coord_err)?;
        self.coordinator.hset(&meta_key, "user_id", user_id).await.map_err(coord_err)?;
        self.coordinator.hset(&meta_key, "mode", &mode.to_string()).await.map_err(coord_err)?;
        self.coordinator.hset(&meta_key, "device", &device.to_string()).await.map_err(coord_err)?;
        self.coordinator.hset(&meta_key, "priority", &priority.to_string()).await.map_err(coord_err)?;
        self.coordinator.hset(&meta_key, "attempts", "0").await.map_err(coord_err)?;
        for (k, v) in meta {
            self.coordinator.hset(&meta_key, &format!("meta.{k}"), &v).await.map_err(coord_err)?;
        }

        self.coordinator.zadd(&self.key("queue:pending"), job_id, priority as f64).await.map_err(coord_err)?;
        self.coordinator.sadd(&self.user_key(user_id, "queued"), job_id).await.map_err(coord_err)?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: &str, _user_id: Option<&str>) -> QueueResult<()> {
        self.coordinator.hset(&self.job_key(job_id, "cancel"), "flag", "1").await.map_err(coord_err)?;
        let _ = self.coordinator.zrem(&self.key("queue:pending"), job_id).await;
        let _ = self.coordinator.zrem(&self.key("queue:delayed"), job_id).await;
        Ok(())
    }

    async fn user_counts(&self, user_id: &str) -> QueueResult<Counts> {
        let running = self.coordinator.scard(&self.user_key(user_id, "running")).await.map_err(coord_err)?;
        let queued = self.coordinator.scard(&self.user_key(user_id, "queued")).await.map_err(coord_err)?;
        Ok(Counts { running, queued })
    }

    async fn user_quota(&self, user_id: &str) -> QueueResult<Option<UserQuotaCounts>> {
        let hash = self.coordinator.hgetall(&self.user_key(user_id, "quota")).await.map_err(coord_err)?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(UserQuotaCounts {
            max_running: hash.get("max_running").and_then(|v| v.parse().ok()),
            max_queued: hash.get("max_queued").and_then(|v| v.parse().ok()),
        }))
    }

    async fn admin_snapshot(&self, limit: usize) -> QueueResult<AdminSnapshot> {
        let pending = self.coordinator.zrange_by_score(&self.key("queue:pending"), f64::MAX).await.map_err(coord_err)?;
        let mut items = Vec::new();
        for m in pending.into_iter().take(limit) {
            let meta = self.coordinator.hgetall(&self.job_key(&m.member, "meta")).await.map_err(coord_err)?;
            items.push(AdminJobSummary {
                job_id: m.member.clone(),
                user_id: meta.get("user_id").cloned().unwrap_or_default(),
                mode: meta.get("mode").cloned().unwrap_or_default(),
                state: "QUEUED".to_string(),
                priority: meta.get("priority").and_then(|v| v.parse().ok()),
            });
        }
        Ok(AdminSnapshot { mode: QueueMode::Distributed, items })
    }

    async fn admin_set_priority(&self, job_id: &str, priority: i64) -> QueueResult<bool> {
        self.coordinator.hset(&self.job_key(job_id, "meta"), "priority", &priority.to_string()).await.map_err(coord_err)?;
        self.coordinator.zadd(&self.key("queue:pending"), job_id, priority as f64).await.map_err(coord_err)?;
        Ok(true)
    }

    async fn admin_set_user_quotas(
        &self,
        user_id: &str,
        max_running: Option<i64>,
        max_queued: Option<i64>,
    ) -> QueueResult<UserQuotaCounts> {
        let key = self.user_key(user_id, "quota");
        if let Some(v) = max_running {
            self.coordinator.hset(&key, "max_running", &v.to_string()).await.map_err(coord_err)?;
        }
        if let Some(v) = max_queued {
            self.coordinator.hset(&key, "max_queued", &v.to_string()).await.map_err(coord_err)?;
        }
        Ok(UserQuotaCounts { max_running, max_queued })
    }

    async fn global_counts(&self) -> QueueResult<Counts> {
        let running = self.coordinator.scard(&self.key("queue:running")).await.map_err(coord_err)?;
        let pending = self.coordinator.zrange_by_score(&self.key("queue:pending"), f64::MAX).await.map_err(coord_err)?;
        Ok(Counts { running, queued: pending.len() as u64 })
    }

    #[instrument(skip(self))]
    async fn before_job_run(&self, job_id: &str, user_id: Option<&str>, role: Role) -> QueueResult<bool> {
        let Some(mut job) = self.store.get_job(job_id).await.map_err(QueueError::from)? else {
            return Err(QueueError::NotFound(job_id.to_string()));
        };
        if job.state.is_terminal() {
            return Ok(false);
        }

        let canceled = self
            .coordinator
            .hgetall(&self.job_key(job_id, "cancel"))
            .await
            .map(|m| !m.is_empty())
            .unwrap_or(false);
        if canceled {
            return Ok(false);
        }

        let uid = user_id.unwrap_or_default();
        let meta = self.coordinator.hgetall(&self.job_key(job_id, "meta")).await.map_err(coord_err)?;
        let priority: i64 = meta.get("priority").and_then(|v| v.parse().ok()).unwrap_or(100);
        let requested_mode: Mode = meta.get("mode").and_then(|v| v.parse().ok()).unwrap_or(job.mode);
        let requested_device: Device = meta.get("device").and_then(|v| v.parse().ok()).unwrap_or(job.device);
        let user_counts = self.user_counts(uid).await?;
        let global_counts = self.global_counts().await?;
        let (global_high_running, user_jobs_today) = crate::backend::policy_counters(self.store.as_ref(), uid).await?;
        let quota = self.user_quota(uid).await?;
        let quota_override = quota.map(|q| core_jobstate::UserQuotaOverride {
            max_running: q.max_running,
            max_queued: q.max_queued,
            ..Default::default()
        });

        let decision = self.policy.evaluate(&PolicyRequest {
            user_id: uid,
            role,
            requested_mode,
            requested_device,
            operation: Operation::Dispatch,
            user_running: user_counts.running as i64,
            user_queued: user_counts.queued as i64,
            user_jobs_today,
            global_running: global_counts.running as i64,
            global_high_running,
            user_quota: quota_override.as_ref(),
            draining: false,
        });

        if !decision.ok {
            self.defer_with_backoff(job_id, priority).await?;
            return Ok(false);
        }

        if job.mode != decision.effective_mode || job.device != decision.effective_device {
            job.mode = decision.effective_mode;
            job.device = decision.effective_device;
            self.store.put_job(&job).await.map_err(QueueError::from)?;
        }

        if user_id.is_some() {
            self.coordinator.srem(&self.user_key(uid, "queued"), job_id).await.map_err(coord_err)?;
            self.coordinator.sadd(&self.user_key(uid, "running"), job_id).await.map_err(coord_err)?;
        }
        self.coordinator.sadd(&self.key("queue:running"), job_id).await.map_err(coord_err)?;
        Ok(true)
    }

    async fn after_job_run(
        &self,
        job_id: &str,
        user_id: Option<&str>,
        _final_state: JobState,
        _ok: bool,
        _error: Option<&str>,
    ) -> QueueResult<()> {
        let mut locks = self.held_locks.lock().await;
        if let Some((token, handle)) = locks.remove(job_id) {
            handle.abort();
            let _ = self.coordinator.delete_if(&self.job_key(job_id, "lock"), &token).await;
        }
        drop(locks);

        self.coordinator.srem(&self.key("queue:running"), job_id).await.map_err(coord_err)?;
        if let Some(uid) = user_id {
            self.coordinator.srem(&self.user_key(uid, "running"), job_id).await.map_err(coord_err)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim(&self) -> QueueResult<Option<String>> {
        // Peek the top of `pending` rather than popping it: a job must stay
        // in `pending` unless the lock acquisition below actually succeeds,
        // per §4.4's invariant that a job is always in exactly one of
        // `pending`, `delayed`, or `running`.
        let pending_key = self.key("queue:pending");
        let top = self
            .coordinator
            .zrange_by_score(&pending_key, f64::MAX)
            .await
            .map_err(coord_err)?
            .into_iter()
            .last();
        let Some(top) = top else {
            return Ok(None);
        };

        let token = Uuid::new_v4().to_string();
        let lock_key = self.job_key(&top.member, "lock");
        let acquired = self.coordinator.set_nx(&lock_key, &token, self.config.lock_ttl).await.map_err(coord_err)?;

        if !acquired {
            // Another worker already holds the lock; leave the job in
            // `pending` untouched since the lock holder is responsible for
            // its lifecycle, not this worker.
            return Ok(None);
        }

        self.coordinator.zrem(&pending_key, &top.member).await.map_err(coord_err)?;

        let handle = self.spawn_lock_refresh(&top.member, token.clone());
        self.held_locks.lock().await.insert(top.member.clone(), (token, handle));

        Ok(Some(top.member))
    }
}

fn coord_err(e: crate::coordinator::CoordinatorError) -> QueueError {
    QueueError::CoordinatorUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryCoordinator;
    use core_jobstate::SqliteStateStore;

    async fn harness() -> (Arc<DistributedQueue>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStateStore::open(dir.path().join("jobs.db").to_str().unwrap()).await.unwrap());
        let coordinator: Arc<dyn KeyedCoordinator> = Arc::new(InMemoryCoordinator::new());
        let queue = Arc::new(DistributedQueue::new(coordinator, store, DistributedQueueConfig::default()));
        (queue, dir)
    }

    fn sample_job(id: &str) -> core_jobstate::Job {
        let now = chrono::Utc::now();
        core_jobstate::Job {
            id: id.to_string(),
            owner_id: "user1".to_string(),
            video_path: "in.mp4".to_string(),
            duration_s: None,
            mode: Mode::Medium,
            device: Device::Auto,
            state: JobState::Queued,
            progress: 0.0,
            message: None,
            error: None,
            visibility: core_jobstate::Visibility::Private,
            runtime: Default::default(),
            library: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn submit_then_claim_returns_the_job() {
        let (queue, _dir) = harness().await;
        queue.store.put_job(&sample_job("job-1")).await.unwrap();
        queue.submit_job("job-1", "user1", Mode::Medium, Device::Auto, 100, HashMap::new()).await.unwrap();
        let claimed = queue.claim().await.unwrap();
        assert_eq!(claimed, Some("job-1".to_string()));
    }

    #[tokio::test]
    async fn higher_priority_job_is_claimed_first() {
        let (queue, _dir) = harness().await;
        queue.store.put_job(&sample_job("low")).await.unwrap();
        queue.store.put_job(&sample_job("high")).await.unwrap();
        queue.submit_job("low", "user1", Mode::Medium, Device::Auto, 10, HashMap::new()).await.unwrap();
        queue.submit_job("high", "user1", Mode::Medium, Device::Auto, 200, HashMap::new()).await.unwrap();
        let claimed = queue.claim().await.unwrap();
        assert_eq!(claimed, Some("high".to_string()));
    }

    #[tokio::test]
    async fn before_job_run_refuses_terminal_jobs() {
        let (queue, _dir) = harness().await;
        let mut job = sample_job("job-1");
        job.state = JobState::Done;
        queue.store.put_job(&job).await.unwrap();
        let ok = queue.before_job_run("job-1", Some("user1"), Role::Operator).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn before_job_run_defers_when_policy_denies_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStateStore::open(dir.path().join("jobs.db").to_str().unwrap()).await.unwrap());
        let coordinator: Arc<dyn KeyedCoordinator> = Arc::new(InMemoryCoordinator::new());
        let limits = crate::policy::GlobalLimits { max_concurrent_jobs: 0, ..Default::default() };
        let queue = DistributedQueue::with_limits(coordinator.clone(), store.clone(), DistributedQueueConfig::default(), limits);

        store.put_job(&sample_job("job-1")).await.unwrap();
        queue.submit_job("job-1", "user1", Mode::Medium, Device::Auto, 100, HashMap::new()).await.unwrap();

        let ok = queue.before_job_run("job-1", Some("user1"), Role::Operator).await.unwrap();
        assert!(!ok);

        let delayed = coordinator.zrange_by_score(&queue.key("queue:delayed"), f64::MAX).await.unwrap();
        assert!(delayed.iter().any(|m| m.member == "job-1"));
    }

    #[tokio::test]
    async fn defer_with_backoff_routes_to_dlq_after_max_attempts() {
        let (queue, _dir) = harness().await;
        for _ in 0..queue.config.max_attempts + 1 {
            queue.defer_with_backoff("job-1", 100).await.unwrap();
        }
        let dlq = queue
            .coordinator
            .zrange_by_score(&queue.key("queue:dlq"), f64::MAX)
            .await
            .unwrap();
        assert!(dlq.iter().any(|m| m.member.starts_with("job-1|")));
    }
}

//! [`AutoQueue`]: starts both [`DistributedQueue`] and [`LocalQueue`], health-
//! monitors the coordinator, and forwards calls to whichever is active.
//!
//! Grounded on `queue/manager.py`'s `AutoQueueBackend`: same forced-mode
//! override (`auto`/`distributed`/`local`), same "flip only on observed
//! transition" monitor loop (here driven by a [`CircuitBreaker`]-style
//! open/closed read instead of a raw ping-and-branch, since the health
//! monitor doubles as the failure counter the circuit breaker already
//! implements), same start/stop ordering (start distributed unconditionally,
//! start local's scan loop only when distributed is not active).

use crate::backend::{AdminSnapshot, Counts, QueueBackend, QueueStatus, UserQuotaCounts};
use crate::coordinator::KeyedCoordinator;
use crate::distributed::DistributedQueue;
use crate::error::QueueResult;
use crate::local::LocalQueue;
use async_trait::async_trait;
use core_jobstate::{Device, JobState, Mode, Role};
use orbit_core_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ResilienceError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

/// Mirrors `QUEUE_MODE ∈ {auto, distributed, local}` from the ambient config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedMode {
    Auto,
    Distributed,
    Local,
}

pub struct AutoQueueConfig {
    pub forced_mode: ForcedMode,
    pub health_poll_interval: Duration,
}

impl Default for AutoQueueConfig {
    fn default() -> Self {
        Self { forced_mode: ForcedMode::Auto, health_poll_interval: Duration::from_secs(2) }
    }
}

pub struct AutoQueue {
    distributed: Arc<DistributedQueue>,
    local: Arc<LocalQueue>,
    coordinator: Arc<dyn KeyedCoordinator>,
    breaker: CircuitBreaker,
    config: AutoQueueConfig,
    distributed_active: Arc<AtomicBool>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AutoQueue {
    pub fn new(
        distributed: Arc<DistributedQueue>,
        local: Arc<LocalQueue>,
        coordinator: Arc<dyn KeyedCoordinator>,
        config: AutoQueueConfig,
    ) -> Self {
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            cooldown: Duration::from_secs(10),
            ..Default::default()
        };
        Self {
            distributed,
            local,
            coordinator,
            breaker: CircuitBreaker::new(breaker_config),
            config,
            distributed_active: Arc::new(AtomicBool::new(false)),
            monitor: std::sync::Mutex::new(None),
        }
    }

    async fn distributed_allowed(&self) -> bool {
        !matches!(self.config.forced_mode, ForcedMode::Local)
    }

    async fn distributed_healthy(&self) -> bool {
        if !self.distributed_allowed().await {
            return false;
        }
        if self.config.forced_mode == ForcedMode::Distributed {
            return true;
        }
        !matches!(self.breaker.get_state().await, CircuitState::Open { .. })
    }

    async fn active(&self) -> &dyn QueueBackend {
        if self.distributed_active.load(Ordering::SeqCst) {
            self.distributed.as_ref()
        } else {
            self.local.as_ref()
        }
    }

    #[instrument(skip(self))]
    async fn monitor_tick(&self) {
        let coordinator = self.coordinator.clone();
        let pinged = self
            .breaker
            .call(|| async {
                coordinator
                    .ping()
                    .await
                    .map_err(|e| ResilienceError::Transient(e.to_string()))
            })
            .await;

        let should_be_active = match self.config.forced_mode {
            ForcedMode::Local => false,
            ForcedMode::Distributed => true,
            ForcedMode::Auto => pinged.is_ok(),
        };

        let was_active = self.distributed_active.swap(should_be_active, Ordering::SeqCst);
        if was_active != should_be_active {
            if should_be_active {
                let _ = self.local.stop().await;
                info!(active = "distributed", "queue.manager_mode");
            } else {
                let _ = self.local.start().await;
                info!(active = "local", "queue.manager_mode");
            }
        }
    }

    /// Spawns the health-monitor loop. Idempotent: a second call is a no-op
    /// while a monitor task is already running.
    pub fn spawn_monitor(self: &Arc<Self>) {
        let mut guard = self.monitor.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        let interval = self.config.health_poll_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                this.monitor_tick().await;
                tokio::time::sleep(interval).await;
            }
        }));
    }

    pub fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl QueueBackend for AutoQueue {
    fn status(&self) -> QueueStatus {
        if self.distributed_active.load(Ordering::SeqCst) {
            self.distributed.status()
        } else {
            self.local.status()
        }
    }

    async fn start(&self) -> QueueResult<()> {
        self.distributed.start().await?;
        if !self.distributed_healthy().await {
            self.local.start().await?;
        } else {
            self.distributed_active.store(true, Ordering::SeqCst);
        }
        info!(forced_mode = ?self.config.forced_mode, "queue.manager_started");
        Ok(())
    }

    async fn stop(&self) -> QueueResult<()> {
        self.stop_monitor();
        let _ = self.local.stop().await;
        self.distributed.stop().await
    }

    async fn submit_job(
        &self,
        job_id: &str,
        user_id: &str,
        mode: Mode,
        device: Device,
        priority: i64,
        meta: HashMap<String, String>,
    ) -> QueueResult<()> {
        if self.distributed_active.load(Ordering::SeqCst) {
            if self
                .distributed
                .submit_job(job_id, user_id, mode, device, priority, meta.clone())
                .await
                .is_ok()
            {
                return Ok(());
            }
        }
        self.local.submit_job(job_id, user_id, mode, device, priority, meta).await
    }

    async fn cancel_job(&self, job_id: &str, user_id: Option<&str>) -> QueueResult<()> {
        let _ = self.distributed.cancel_job(job_id, user_id).await;
        self.local.cancel_job(job_id, user_id).await
    }

    async fn user_counts(&self, user_id: &str) -> QueueResult<Counts> {
        self.active().await.user_counts(user_id).await
    }

    async fn user_quota(&self, user_id: &str) -> QueueResult<Option<UserQuotaCounts>> {
        self.active().await.user_quota(user_id).await
    }

    async fn admin_snapshot(&self, limit: usize) -> QueueResult<AdminSnapshot> {
        self.active().await.admin_snapshot(limit).await
    }

    async fn admin_set_priority(&self, job_id: &str, priority: i64) -> QueueResult<bool> {
        self.active().await.admin_set_priority(job_id, priority).await
    }

    async fn admin_set_user_quotas(
        &self,
        user_id: &str,
        max_running: Option<i64>,
        max_queued: Option<i64>,
    ) -> QueueResult<UserQuotaCounts> {
        self.active().await.admin_set_user_quotas(user_id, max_running, max_queued).await
    }

    async fn global_counts(&self) -> QueueResult<Counts> {
        self.active().await.global_counts().await
    }

    async fn before_job_run(&self, job_id: &str, user_id: Option<&str>, role: Role) -> QueueResult<bool> {
        self.active().await.before_job_run(job_id, user_id, role).await
    }

    async fn after_job_run(
        &self,
        job_id: &str,
        user_id: Option<&str>,
        final_state: JobState,
        ok: bool,
        error: Option<&str>,
    ) -> QueueResult<()> {
        let _ = self.distributed.after_job_run(job_id, user_id, final_state, ok, error).await;
        self.local.after_job_run(job_id, user_id, final_state, ok, error).await
    }

    async fn claim(&self) -> QueueResult<Option<String>> {
        self.active().await.claim().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryCoordinator;
    use crate::distributed::DistributedQueueConfig;
    use crate::policy::GlobalLimits;
    use core_jobstate::SqliteStateStore;

    async fn harness() -> (Arc<AutoQueue>, Arc<InMemoryCoordinator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStateStore::open(dir.path().join("jobs.db").to_str().unwrap()).await.unwrap());
        let in_memory = Arc::new(InMemoryCoordinator::new());
        let coordinator: Arc<dyn KeyedCoordinator> = in_memory.clone();
        let distributed = Arc::new(DistributedQueue::new(coordinator.clone(), store.clone(), DistributedQueueConfig::default()));
        let local = Arc::new(LocalQueue::new(store, GlobalLimits::default()));
        let auto = Arc::new(AutoQueue::new(distributed, local, coordinator, AutoQueueConfig::default()));
        (auto, in_memory, dir)
    }

    #[tokio::test]
    async fn starts_distributed_active_when_coordinator_is_healthy() {
        let (auto, _coordinator, _dir) = harness().await;
        auto.start().await.unwrap();
        assert!(auto.distributed_active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn monitor_tick_flips_to_local_when_coordinator_goes_unreachable() {
        let (auto, coordinator, _dir) = harness().await;
        auto.start().await.unwrap();
        coordinator.set_reachable(false);
        for _ in 0..3 {
            auto.monitor_tick().await;
        }
        assert!(!auto.distributed_active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn forced_local_mode_never_activates_distributed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStateStore::open(dir.path().join("jobs.db").to_str().unwrap()).await.unwrap());
        let in_memory = Arc::new(InMemoryCoordinator::new());
        let coordinator: Arc<dyn KeyedCoordinator> = in_memory.clone();
        let distributed = Arc::new(DistributedQueue::new(coordinator.clone(), store.clone(), DistributedQueueConfig::default()));
        let local = Arc::new(LocalQueue::new(store, GlobalLimits::default()));
        let config = AutoQueueConfig { forced_mode: ForcedMode::Local, health_poll_interval: Duration::from_secs(2) };
        let auto = AutoQueue::new(distributed, local, coordinator, config);
        auto.start().await.unwrap();
        assert!(!auto.distributed_active.load(Ordering::SeqCst));
    }
}

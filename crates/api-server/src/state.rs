//! Global application state shared across all HTTP handlers.

use core_jobstate::quota::{QuotaDefaults, QuotaEnforcer, StorageReservation};
use core_jobstate::upload::UploadSessionManager;
use core_jobstate::StateStore;
use core_queue::coordinator::InMemoryCoordinator;
use core_queue::{AutoQueue, AutoQueueConfig, DistributedQueue, DistributedQueueConfig, LocalQueue, QueueBackend};
use orbit_core_audit::AuditLog;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};

/// Per-job SSE fanout. Unlike the teacher's single global `OrbitEvent`
/// channel, subscriptions here are keyed implicitly by filtering on
/// `job_id` in the handler, since `/events/jobs/{id}` is scoped to one job.
#[derive(Clone)]
pub struct JobEventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl JobEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub state: String,
    pub progress: f64,
    pub message: Option<String>,
}

/// Explicit process-lifecycle draining flag, per SPEC_FULL.md's design note
/// to model draining as a passed-in object rather than a global/import.
#[derive(Clone)]
pub struct DrainGuard {
    draining: Arc<AtomicBool>,
}

impl DrainGuard {
    pub fn new() -> Self {
        Self { draining: Arc::new(AtomicBool::new(false)) }
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

impl Default for DrainGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Durable job/upload/quota state.
    pub store: Arc<dyn StateStore>,

    /// Job queue backend (local, distributed, or auto-switching between them).
    pub queue: Arc<dyn QueueBackend>,

    /// Two-phase quota reservation enforcer.
    pub quota: Arc<QuotaEnforcer>,

    /// Resumable chunked upload session manager.
    pub uploads: Arc<UploadSessionManager>,

    /// Append-only audit sink.
    pub audit: AuditLog,

    /// User authentication database (separate from the jobs/uploads store).
    pub user_pool: SqlitePool,

    /// Per-job SSE fanout.
    pub events: JobEventBus,

    /// Set when the process has received SIGTERM/SIGINT and is refusing new
    /// submissions while letting in-flight jobs finish.
    pub drain: DrainGuard,

    /// Wakes idle `JobExecutor` workers as soon as a job is submitted,
    /// instead of waiting out their heartbeat sleep. Grounded on
    /// `reactor.rs`'s `Reactor::run`, which the same way shares one
    /// `Notify` between the API handler and the claim loop.
    pub notify: Arc<Notify>,

    /// Open storage-quota reservations, keyed by upload id, held between
    /// `init_upload` and `complete_upload`/retention cleanup. A reservation
    /// in this map counts toward a user's `max_storage_bytes` cap even
    /// though the upload hasn't finished writing bytes to disk yet; see
    /// `core_jobstate::quota::QuotaEnforcer::reserve_storage_bytes`.
    pub reservations: Arc<Mutex<HashMap<String, StorageReservation>>>,

    pub jwt_secret: Arc<String>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn QueueBackend>,
        quota: Arc<QuotaEnforcer>,
        uploads: Arc<UploadSessionManager>,
        audit: AuditLog,
        user_pool: SqlitePool,
        jwt_secret: String,
    ) -> Self {
        Self {
            store,
            queue,
            quota,
            uploads,
            audit,
            user_pool,
            events: JobEventBus::new(),
            drain: DrainGuard::new(),
            notify: Arc::new(Notify::new()),
            reservations: Arc::new(Mutex::new(HashMap::new())),
            jwt_secret: Arc::new(jwt_secret),
        }
    }
}

/// Builds the default `local`-or-`distributed` auto-switching queue over an
/// in-process coordinator. Production deployments that run more than one
/// `api-server` replica need a real shared `KeyedCoordinator` (e.g. backed by
/// Redis); no such client exists in this workspace, so `AutoQueue` here will
/// never observe the coordinator as unreachable and effectively always
/// behaves as `DistributedQueue` against `InMemoryCoordinator`. Tracked in
/// DESIGN.md.
pub fn build_auto_queue(store: Arc<dyn StateStore>) -> Arc<dyn QueueBackend> {
    let coordinator: Arc<dyn core_queue::coordinator::KeyedCoordinator> = Arc::new(InMemoryCoordinator::new());
    let distributed = Arc::new(DistributedQueue::new(
        coordinator.clone(),
        store.clone(),
        DistributedQueueConfig::default(),
    ));
    let local = Arc::new(LocalQueue::new(store, core_queue::policy::GlobalLimits::default()));
    Arc::new(AutoQueue::new(distributed, local, coordinator, AutoQueueConfig::default()))
}

pub fn default_quota_defaults() -> QuotaDefaults {
    QuotaDefaults::default()
}

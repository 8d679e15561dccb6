//! QuotaEnforcer: per-user resource caps with RAII-released reservations.
//!
//! Ported from the two-phase reserve/release pattern in the Python original's
//! `security/quotas.py`: a limit check and a reservation happen together, and
//! the reservation is released exactly once, either by the caller on success
//! or by the guard's `Drop` if the caller forgot or the job failed before
//! releasing. This makes "forgot to release" structurally impossible rather
//! than a convention.
//!
//! Limits resolve user overrides first (`StateStore::get_user_quota`), then
//! fall back to the process-wide defaults in [`QuotaDefaults`]. An admin with
//! no explicit per-user override bypasses caps entirely, mirroring the
//! Python's `_admin_bypass` rule.

use crate::{Role, StateError, StateResult, StateStore, UserQuotaOverride};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct QuotaDefaults {
    pub max_running: i64,
    pub max_queued: i64,
    pub jobs_per_day: i64,
    pub max_storage_bytes: i64,
    pub max_upload_bytes: i64,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            max_running: 2,
            max_queued: 10,
            jobs_per_day: 50,
            max_storage_bytes: 50 * 1024 * 1024 * 1024,
            max_upload_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    Ok,
    Exceeded,
}

#[derive(Debug, thiserror::Error)]
#[error("quota exceeded: {reason}")]
pub struct QuotaExceededError {
    pub reason: String,
}

/// Resolved limits for a single user, after override/default/admin-bypass
/// resolution.
#[derive(Debug, Clone)]
struct ResolvedLimits {
    max_running: Option<i64>,
    max_queued: Option<i64>,
    jobs_per_day: Option<i64>,
    max_storage_bytes: Option<i64>,
    max_upload_bytes: Option<i64>,
}

/// In-process daily submission counters, keyed by (day, user_id).
///
/// The spec's Non-goals exclude a distributed coordinator implementation, so
/// this mirrors the Python's `_reserve_daily_local` path: an async-mutex-
/// guarded map rather than a Lua script against a shared cache.
struct DailyCounters {
    counts: AsyncMutex<HashMap<(String, String), i64>>,
}

impl DailyCounters {
    fn new() -> Self {
        Self {
            counts: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn reserve(&self, day: &str, user_id: &str, limit: i64) -> Result<(), QuotaExceededError> {
        let mut counts = self.counts.lock().await;
        let key = (day.to_string(), user_id.to_string());
        let current = *counts.get(&key).unwrap_or(&0);
        if current >= limit {
            return Err(QuotaExceededError {
                reason: format!("daily job submission limit reached ({limit}/day)"),
            });
        }
        counts.insert(key, current + 1);
        Ok(())
    }

    async fn release(&self, day: &str, user_id: &str) {
        let mut counts = self.counts.lock().await;
        let key = (day.to_string(), user_id.to_string());
        if let Some(v) = counts.get_mut(&key) {
            *v = (*v - 1).max(0);
        }
    }
}

/// A reservation against the concurrent-job-submission limit, held for the
/// lifetime of a submit request. Release is idempotent; dropping without
/// releasing logs a warning and releases anyway.
pub struct JobReservation {
    enforcer: Arc<QuotaEnforcerInner>,
    day: String,
    user_id: String,
    released: bool,
}

impl JobReservation {
    /// Undoes the reservation. Call this when the submit request fails
    /// after the slot was reserved (e.g. the concurrency check or the queue
    /// submit itself fails) so a rejected submission doesn't count against
    /// the caller's daily cap.
    pub async fn release(mut self) {
        self.enforcer.daily.release(&self.day, &self.user_id).await;
        self.released = true;
    }

    /// Keeps the reservation in place for the rest of the UTC day. Call
    /// this once the submission the slot was reserved for has actually
    /// succeeded; the per-day counter key means it is implicitly released
    /// by the next day's key rather than by this guard.
    pub fn keep(mut self) {
        self.released = true;
    }
}

impl Drop for JobReservation {
    fn drop(&mut self) {
        if !self.released {
            warn!(user_id = %self.user_id, "job reservation dropped without explicit release");
            let enforcer = self.enforcer.clone();
            let day = self.day.clone();
            let user_id = self.user_id.clone();
            tokio::spawn(async move {
                enforcer.daily.release(&day, &user_id).await;
            });
        }
    }
}

/// A reservation against `max_storage_bytes`, held for the duration of an
/// upload. On failed/aborted uploads the caller must release; on success the
/// reservation is simply dropped (the bytes are now real storage, counted by
/// `StateStore::get_user_storage_bytes`, not by this in-memory reservation).
pub struct StorageReservation {
    enforcer: Arc<QuotaEnforcerInner>,
    user_id: String,
    bytes: u64,
    released: bool,
}

impl StorageReservation {
    pub async fn release(mut self) {
        self.enforcer.release_storage(&self.user_id, self.bytes).await;
        self.released = true;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for StorageReservation {
    fn drop(&mut self) {
        if !self.released {
            warn!(user_id = %self.user_id, bytes = self.bytes, "storage reservation dropped without explicit release");
            let enforcer = self.enforcer.clone();
            let user_id = self.user_id.clone();
            let bytes = self.bytes;
            tokio::spawn(async move {
                enforcer.release_storage(&user_id, bytes).await;
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuotaSnapshot {
    pub running: i64,
    pub queued: i64,
    pub limits: QuotaDefaults,
}

struct QuotaEnforcerInner {
    store: Arc<dyn StateStore>,
    defaults: QuotaDefaults,
    daily: DailyCounters,
    /// Tentatively-reserved storage bytes not yet reflected by
    /// `get_user_storage_bytes` (upload in flight), keyed by user.
    pending_storage: AsyncMutex<HashMap<String, u64>>,
}

impl QuotaEnforcerInner {
    async fn release_storage(&self, user_id: &str, bytes: u64) {
        let mut pending = self.pending_storage.lock().await;
        if let Some(v) = pending.get_mut(user_id) {
            *v = v.saturating_sub(bytes);
        }
    }
}

pub struct QuotaEnforcer {
    inner: Arc<QuotaEnforcerInner>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn StateStore>, defaults: QuotaDefaults) -> Self {
        Self {
            inner: Arc::new(QuotaEnforcerInner {
                store,
                defaults,
                daily: DailyCounters::new(),
                pending_storage: AsyncMutex::new(HashMap::new()),
            }),
        }
    }

    async fn resolve_limits(&self, user_id: &str, role: Role) -> StateResult<ResolvedLimits> {
        let overrides = self.inner.store.get_user_quota(user_id).await?;

        let has_override = overrides.is_some();
        let overrides = overrides.unwrap_or_default();

        if role == Role::Admin && !has_override {
            return Ok(ResolvedLimits {
                max_running: None,
                max_queued: None,
                jobs_per_day: None,
                max_storage_bytes: None,
                max_upload_bytes: None,
            });
        }

        Ok(ResolvedLimits {
            max_running: Some(overrides.max_running.unwrap_or(self.inner.defaults.max_running)),
            max_queued: Some(overrides.max_queued.unwrap_or(self.inner.defaults.max_queued)),
            jobs_per_day: Some(overrides.jobs_per_day.unwrap_or(self.inner.defaults.jobs_per_day)),
            max_storage_bytes: Some(
                overrides
                    .max_storage_bytes
                    .unwrap_or(self.inner.defaults.max_storage_bytes),
            ),
            max_upload_bytes: Some(
                overrides
                    .max_upload_bytes
                    .unwrap_or(self.inner.defaults.max_upload_bytes),
            ),
        })
    }

    /// Checks and reserves a daily submission slot. Returns a guard: call
    /// [`JobReservation::release`] if the submit subsequently fails, or
    /// [`JobReservation::keep`] once it succeeds.
    pub async fn reserve_daily_job(
        &self,
        user_id: &str,
        role: Role,
    ) -> Result<JobReservation, QuotaExceededError> {
        let limits = self
            .resolve_limits(user_id, role)
            .await
            .map_err(|e| QuotaExceededError { reason: e.to_string() })?;

        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();

        if let Some(limit) = limits.jobs_per_day {
            self.inner.daily.reserve(&day, user_id, limit).await?;
        }

        Ok(JobReservation {
            enforcer: self.inner.clone(),
            day,
            user_id: user_id.to_string(),
            released: false,
        })
    }

    /// Checks concurrent running+queued job counts against `max_running` and
    /// `max_queued`. Does not reserve anything: the caller passes the live
    /// counts from `StateStore::list_jobs`.
    pub async fn check_concurrent_jobs(
        &self,
        user_id: &str,
        role: Role,
        running: i64,
        queued: i64,
    ) -> Result<(), QuotaExceededError> {
        let limits = self
            .resolve_limits(user_id, role)
            .await
            .map_err(|e| QuotaExceededError { reason: e.to_string() })?;

        if let Some(max_running) = limits.max_running {
            if running >= max_running {
                return Err(QuotaExceededError {
                    reason: format!("too many running jobs ({running}/{max_running})"),
                });
            }
        }
        if let Some(max_queued) = limits.max_queued {
            if queued >= max_queued {
                return Err(QuotaExceededError {
                    reason: format!("too many queued jobs ({queued}/{max_queued})"),
                });
            }
        }
        Ok(())
    }

    /// Checks a single upload's declared size against `max_upload_bytes`.
    pub async fn check_upload_bytes(
        &self,
        user_id: &str,
        role: Role,
        declared_bytes: u64,
    ) -> Result<(), QuotaExceededError> {
        let limits = self
            .resolve_limits(user_id, role)
            .await
            .map_err(|e| QuotaExceededError { reason: e.to_string() })?;

        if let Some(max) = limits.max_upload_bytes {
            if declared_bytes > max as u64 {
                return Err(QuotaExceededError {
                    reason: format!("upload too large ({declared_bytes}/{max} bytes)"),
                });
            }
        }
        Ok(())
    }

    /// Reserves `bytes` against `max_storage_bytes`, combining durable usage
    /// from the store with any in-flight reservations for the same user.
    pub async fn reserve_storage_bytes(
        &self,
        user_id: &str,
        role: Role,
        bytes: u64,
    ) -> Result<StorageReservation, QuotaExceededError> {
        let limits = self
            .resolve_limits(user_id, role)
            .await
            .map_err(|e| QuotaExceededError { reason: e.to_string() })?;

        if let Some(max) = limits.max_storage_bytes {
            let used = self
                .inner
                .store
                .get_user_storage_bytes(user_id)
                .await
                .map_err(|e| QuotaExceededError { reason: e.to_string() })?;

            let mut pending = self.inner.pending_storage.lock().await;
            let in_flight = *pending.get(user_id).unwrap_or(&0);

            if used + in_flight + bytes > max as u64 {
                return Err(QuotaExceededError {
                    reason: format!("storage quota exceeded ({}/{} bytes)", used + in_flight + bytes, max),
                });
            }

            *pending.entry(user_id.to_string()).or_insert(0) += bytes;
        }

        Ok(StorageReservation {
            enforcer: self.inner.clone(),
            user_id: user_id.to_string(),
            bytes,
            released: false,
        })
    }

    pub async fn snapshot(&self, user_id: &str, role: Role) -> StateResult<QuotaSnapshot> {
        let overrides = self
            .inner
            .store
            .get_user_quota(user_id)
            .await?
            .unwrap_or_default();
        let _ = role;
        Ok(QuotaSnapshot {
            running: 0,
            queued: 0,
            limits: QuotaDefaults {
                max_running: overrides.max_running.unwrap_or(self.inner.defaults.max_running),
                max_queued: overrides.max_queued.unwrap_or(self.inner.defaults.max_queued),
                jobs_per_day: overrides.jobs_per_day.unwrap_or(self.inner.defaults.jobs_per_day),
                max_storage_bytes: overrides
                    .max_storage_bytes
                    .unwrap_or(self.inner.defaults.max_storage_bytes),
                max_upload_bytes: overrides
                    .max_upload_bytes
                    .unwrap_or(self.inner.defaults.max_upload_bytes),
            },
        })
    }

    pub async fn set_user_overrides(
        &self,
        user_id: &str,
        overrides: &UserQuotaOverride,
    ) -> StateResult<()> {
        self.inner.store.upsert_user_quota(user_id, overrides).await
    }
}

impl From<StateError> for QuotaExceededError {
    fn from(e: StateError) -> Self {
        QuotaExceededError { reason: e.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sqlite::SqliteStateStore;

    async fn test_store() -> Arc<dyn StateStore> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota-test.db");
        // Leak the tempdir so the file survives for the test's duration.
        std::mem::forget(dir);
        Arc::new(SqliteStateStore::open(path.to_str().unwrap()).await.unwrap())
    }

    #[tokio::test]
    async fn admin_without_override_bypasses_caps() {
        let store = test_store().await;
        let enforcer = QuotaEnforcer::new(store, QuotaDefaults::default());

        let result = enforcer
            .check_upload_bytes("admin-1", Role::Admin, u64::MAX / 2)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn viewer_respects_default_upload_limit() {
        let store = test_store().await;
        let defaults = QuotaDefaults {
            max_upload_bytes: 1024,
            ..QuotaDefaults::default()
        };
        let enforcer = QuotaEnforcer::new(store, defaults);

        let result = enforcer.check_upload_bytes("user-1", Role::Viewer, 2048).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn daily_job_reservation_enforces_limit_then_releases() {
        let store = test_store().await;
        let defaults = QuotaDefaults {
            jobs_per_day: 1,
            ..QuotaDefaults::default()
        };
        let enforcer = QuotaEnforcer::new(store, defaults);

        let r1 = enforcer.reserve_daily_job("user-1", Role::Operator).await.unwrap();
        let second = enforcer.reserve_daily_job("user-1", Role::Operator).await;
        assert!(second.is_err());

        r1.release().await;
        let third = enforcer.reserve_daily_job("user-1", Role::Operator).await;
        assert!(third.is_ok());
    }
}

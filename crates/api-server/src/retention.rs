//! RetentionSweeper: periodic cleanup of abandoned uploads, expired job
//! artifacts, and old logs.
//!
//! Grounded on `reactor.rs`'s loop shape (a `tokio::select!` between a sleep
//! and an early-wake signal) generalized from "claim one job" to "sweep one
//! category at a time". Every deletion is validated against its configured
//! root first; the safety invariant ("no deletion for a path that does not
//! resolve inside the designated root") is the one piece of this module that
//! must never be weakened.

use core_jobstate::quota::StorageReservation;
use core_jobstate::{Job, JobFilter, JobState, StateStore};
use orbit_core_audit::{AuditEvent, AuditLog};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub output_root: PathBuf,
    pub upload_root: PathBuf,
    pub logs_root: PathBuf,
    pub upload_ttl: chrono::Duration,
    pub retention_days: i64,
    pub log_days: i64,
    pub sweep_interval: Duration,
}

impl RetentionConfig {
    pub fn from_env(output_root: PathBuf, upload_root: PathBuf, logs_root: PathBuf) -> Self {
        let upload_ttl_hours: i64 = std::env::var("UPLOAD_TTL_HOURS").ok().and_then(|v| v.parse().ok()).unwrap_or(24);
        let retention_days: i64 = std::env::var("RETENTION_DAYS").ok().and_then(|v| v.parse().ok()).unwrap_or(30);
        let log_days: i64 = std::env::var("LOG_RETENTION_DAYS").ok().and_then(|v| v.parse().ok()).unwrap_or(14);
        let sweep_interval_secs: u64 = std::env::var("RETENTION_INTERVAL_SEC").ok().and_then(|v| v.parse().ok()).unwrap_or(3600);

        Self {
            output_root,
            upload_root,
            logs_root,
            upload_ttl: chrono::Duration::hours(upload_ttl_hours),
            retention_days,
            log_days,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub uploads_removed: u64,
    pub jobs_removed: u64,
    pub logs_removed: u64,
    pub bytes_freed: u64,
}

pub struct RetentionSweeper {
    store: Arc<dyn StateStore>,
    audit: AuditLog,
    config: RetentionConfig,
    /// Open storage-quota reservations keyed by upload id, shared with the
    /// API handlers in `api::uploads`. An abandoned upload's reservation is
    /// released here, since `complete_upload` never runs for it.
    reservations: Option<Arc<Mutex<HashMap<String, StorageReservation>>>>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn StateStore>, audit: AuditLog, config: RetentionConfig) -> Self {
        Self { store, audit, config, reservations: None }
    }

    /// Attaches the upload-reservation registry so abandoned uploads release
    /// their storage-quota hold instead of leaking it until the in-memory
    /// process restarts. The standalone `retention run-once` CLI subcommand
    /// has no live registry to attach (its reservations live in a different
    /// process's memory and are long since dropped), so this is optional.
    pub fn with_reservations(mut self, reservations: Arc<Mutex<HashMap<String, StorageReservation>>>) -> Self {
        self.reservations = Some(reservations);
        self
    }

    /// Runs forever, sweeping at `config.sweep_interval`.
    pub async fn run(self) {
        info!(interval_secs = self.config.sweep_interval.as_secs(), "retention sweeper started");
        loop {
            tokio::time::sleep(self.config.sweep_interval).await;
            let summary = self.run_once().await;
            info!(
                uploads_removed = summary.uploads_removed,
                jobs_removed = summary.jobs_removed,
                logs_removed = summary.logs_removed,
                bytes_freed = summary.bytes_freed,
                "retention sweep complete"
            );
        }
    }

    /// One sweep pass: abandoned uploads, expired job artifacts, old logs.
    /// Exposed directly for the `retention run-once` CLI subcommand.
    pub async fn run_once(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        summary.uploads_removed += self.sweep_uploads().await;
        summary.jobs_removed += self.sweep_jobs().await;
        summary.logs_removed += self.sweep_logs().await;

        summary
    }

    async fn sweep_uploads(&self) -> u64 {
        let sessions = match self.store.list_uploads(None, false).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to list uploads for retention sweep");
                return 0;
            }
        };

        let cutoff = chrono::Utc::now() - self.config.upload_ttl;
        let mut removed = 0;

        for session in sessions {
            if session.completed || session.updated_at > cutoff {
                continue;
            }

            if !self.delete_under_root(&self.config.upload_root, Path::new(&session.part_path))
                || !self.delete_under_root(&self.config.upload_root, Path::new(&session.final_path))
            {
                self.skip_unsafe("upload", &session.id);
                continue;
            }

            if let Err(e) = self.store.delete_upload(&session.id).await {
                warn!(upload_id = %session.id, error = %e, "failed to delete upload record during sweep");
                continue;
            }

            if let Some(reservations) = &self.reservations {
                if let Some(reservation) = reservations.lock().await.remove(&session.id) {
                    reservation.release().await;
                }
            }

            self.audit.record(AuditEvent::new("retention.upload.delete").with_meta("upload_id", &session.id));
            removed += 1;
        }

        removed
    }

    async fn sweep_jobs(&self) -> u64 {
        let jobs = match self.store.list_jobs(usize::MAX, &JobFilter::default()).await {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to list jobs for retention sweep");
                return 0;
            }
        };

        let cutoff = chrono::Utc::now() - chrono::Duration::days(self.config.retention_days);
        let mut removed = 0;

        for job in jobs {
            if matches!(job.state, JobState::Running | JobState::Queued | JobState::Paused) {
                continue;
            }
            if job.is_pinned() || job.updated_at > cutoff {
                continue;
            }

            if !self.delete_job_artifacts(&job) {
                self.skip_unsafe("job", &job.id);
                continue;
            }

            if let Err(e) = self.store.delete_job(&job.id).await {
                warn!(job_id = %job.id, error = %e, "failed to delete job record during sweep");
                continue;
            }

            self.audit.record(AuditEvent::new("retention.job.delete").with_job(job.id.clone()));
            removed += 1;
        }

        removed
    }

    fn delete_job_artifacts(&self, job: &Job) -> bool {
        let dir = self.config.output_root.join(&job.id);
        if !dir.exists() {
            return true;
        }
        self.delete_under_root(&self.config.output_root, &dir)
    }

    fn sweep_logs(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.config.logs_root) else {
            return 0;
        };

        let cutoff = std::time::SystemTime::now()
            .checked_sub(Duration::from_secs(self.config.log_days.max(0) as u64 * 86_400));
        let Some(cutoff) = cutoff else { return 0 };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if modified > cutoff {
                continue;
            }
            if !is_strictly_under(&self.config.logs_root, &path) {
                self.skip_unsafe("log", &path.to_string_lossy());
                continue;
            }
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            self.audit.record(AuditEvent::new("retention.logs.delete").with_meta("count", removed));
        }

        removed
    }

    fn skip_unsafe(&self, category: &str, id: &str) {
        warn!(category, id, "retention sweep aborted deletion outside configured root");
        self.audit.record(
            AuditEvent::new("retention.job.skip_unsafe")
                .with_meta("category", category)
                .with_meta("id", id),
        );
    }

    /// Deletes a file or directory tree, refusing if it does not resolve
    /// strictly under `root`.
    fn delete_under_root(&self, root: &Path, target: &Path) -> bool {
        if !is_strictly_under(root, target) {
            return false;
        }
        if !target.exists() {
            return true;
        }
        let result = if target.is_dir() { std::fs::remove_dir_all(target) } else { std::fs::remove_file(target) };
        result.is_ok()
    }
}

/// Best-effort containment check: canonicalizes both paths when they exist
/// (resolving symlinks), otherwise falls back to rejecting any `..`
/// component so a non-existent target can't be used to infer traversal
/// outside `root`. Free function (not a method) since it only ever touches
/// its arguments — kept that way so it's trivial to unit test in isolation
/// from the rest of `RetentionSweeper`'s state.
fn is_strictly_under(root: &Path, target: &Path) -> bool {
    if target.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return false;
    }

    match (root.canonicalize(), target.canonicalize()) {
        (Ok(root), Ok(target)) => target.starts_with(&root) && target != root,
        _ => target.starts_with(root) && target != root,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir_traversal_even_if_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let escape = dir.path().join("../../etc/passwd");
        assert!(!is_strictly_under(dir.path(), &escape));
    }

    #[test]
    fn accepts_path_nested_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("jobs/abc")).unwrap();
        assert!(is_strictly_under(dir.path(), &dir.path().join("jobs/abc")));
    }

    #[test]
    fn rejects_root_itself() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_strictly_under(dir.path(), dir.path()));
    }

    #[test]
    fn rejects_sibling_directory_via_lexical_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("output");
        let sibling = dir.path().join("output-backup/job-1");
        assert!(!is_strictly_under(&root, &sibling));
    }

    #[test]
    fn config_from_env_falls_back_to_defaults() {
        for var in ["UPLOAD_TTL_HOURS", "RETENTION_DAYS", "LOG_RETENTION_DAYS", "RETENTION_INTERVAL_SEC"] {
            std::env::remove_var(var);
        }
        let config = RetentionConfig::from_env("out".into(), "uploads".into(), "logs".into());
        assert_eq!(config.upload_ttl, chrono::Duration::hours(24));
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.log_days, 14);
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
    }
}

//! Durable state store for dubbing jobs, resumable uploads, and per-user quota
//! overrides.
//!
//! [`StateStore`] is the single source of truth for job and upload metadata.
//! It is exclusively owned by the service: queue/lock state is a separate
//! concern (see the `core-queue` crate), and this crate knows nothing about
//! priority ordering or distributed locks, only the durable record.
//!
//! # Example
//!
//! ```no_run
//! use core_jobstate::{StateStore, Job};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = core_jobstate::open("jobs.db").await?;
//!     let job = store.get_job("some-id").await?;
//!     println!("{:?}", job);
//!     Ok(())
//! }
//! ```

pub mod backends;
pub mod config;
pub mod executor;
pub mod manager;
pub mod quota;
pub mod upload;

pub use backends::sqlite::SqliteStateStore;
pub use manager::{ProgressWriter, ProgressWriterConfig};
pub use quota::{JobReservation, QuotaEnforcer, QuotaSnapshot, StorageReservation};
pub use upload::{ChunkAcceptance, UploadSessionManager};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors surfaced by [`StateStore`] implementations.
///
/// These map onto the HTTP error taxonomy one-to-one; the HTTP layer is the
/// only place they are translated into status codes.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StateResult<T> = Result<T, StateError>;

/// Job execution state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
    Paused,
}

impl JobState {
    /// Terminal states are never re-run and may be garbage collected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }

    /// States RetentionSweeper must never touch (still live work).
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running | JobState::Queued | JobState::Paused)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
            JobState::Paused => "PAUSED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobState::Queued),
            "RUNNING" => Ok(JobState::Running),
            "DONE" => Ok(JobState::Done),
            "FAILED" => Ok(JobState::Failed),
            "CANCELED" => Ok(JobState::Canceled),
            "PAUSED" => Ok(JobState::Paused),
            other => Err(StateError::Validation(format!("unknown job state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Low,
    Medium,
    High,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Low => "low",
            Mode::Medium => "medium",
            Mode::High => "high",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Mode {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Mode::Low),
            "medium" => Ok(Mode::Medium),
            "high" => Ok(Mode::High),
            other => Err(StateError::Validation(format!("unknown mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Auto,
    Cpu,
    Gpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Device {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "gpu" => Ok(Device::Gpu),
            other => Err(StateError::Validation(format!("unknown device: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Shared,
}

/// Resolved caller role, produced by the HTTP layer's AuthContext and
/// consumed here by [`QuotaEnforcer`] and [`PolicyEngine`]-adjacent checks.
/// This crate never verifies credentials; it only acts on an already-resolved
/// role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Role {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(StateError::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// Recognized keys in [`Job::runtime`], per the dynamic-collection design
/// note. Anything else is preserved but not interpreted.
pub mod runtime_keys {
    pub const PINNED: &str = "pinned";
    pub const ARCHIVED: &str = "archived";
    pub const RESYNTH: &str = "resynth";
    pub const PRIVACY_MODE: &str = "privacy_mode";
    pub const CACHE_POLICY: &str = "cache_policy";
    pub const TAGS: &str = "tags";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryMetadata {
    pub series_slug: Option<String>,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner_id: String,
    pub video_path: String,
    pub duration_s: Option<f64>,
    pub mode: Mode,
    pub device: Device,
    pub state: JobState,
    pub progress: f64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub visibility: Visibility,
    pub runtime: serde_json::Map<String, serde_json::Value>,
    pub library: LibraryMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Pinned or archived jobs are exempt from retention sweeps.
    pub fn is_pinned(&self) -> bool {
        self.runtime
            .get(runtime_keys::PINNED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            || self
                .runtime
                .get(runtime_keys::ARCHIVED)
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }
}

/// A single accepted chunk of an in-progress upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedChunk {
    pub offset: u64,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub total_bytes: u64,
    pub chunk_bytes: u64,
    pub total_chunks: u64,
    pub part_path: String,
    pub final_path: String,
    pub received: BTreeMap<u64, ReceivedChunk>,
    /// Maintained incrementally at insertion time, never recomputed by
    /// summing `received`.
    pub received_bytes: u64,
    pub completed: bool,
    pub final_sha256: Option<String>,
    pub expected_sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn missing_chunks(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|idx| !self.received.contains_key(idx))
            .collect()
    }

    pub fn expected_chunk_size(&self, index: u64) -> Option<u64> {
        if index >= self.total_chunks {
            return None;
        }
        if index < self.total_chunks - 1 {
            Some(self.chunk_bytes)
        } else {
            Some(self.total_bytes - index * self.chunk_bytes)
        }
    }

    pub fn expected_offset(&self, index: u64) -> u64 {
        index * self.chunk_bytes
    }

    pub fn is_complete_on_disk(&self) -> bool {
        self.received.len() as u64 == self.total_chunks
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserQuotaOverride {
    pub max_running: Option<i64>,
    pub max_queued: Option<i64>,
    pub jobs_per_day: Option<i64>,
    pub max_storage_bytes: Option<i64>,
    pub max_upload_bytes: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner_id: Option<String>,
    pub state: Option<JobState>,
}

/// Durable record of jobs, uploads, quota overrides, and idempotency keys.
///
/// Single-writer discipline: implementations serialize writes (an advisory
/// file lock for the SQLite backend) while allowing concurrent reads. A
/// failed write must leave no partial effect observable to subsequent reads.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_job(&self, job: &Job) -> StateResult<()>;
    async fn get_job(&self, id: &str) -> StateResult<Option<Job>>;
    async fn list_jobs(&self, limit: usize, filter: &JobFilter) -> StateResult<Vec<Job>>;
    async fn delete_job(&self, id: &str) -> StateResult<()>;

    /// Narrow, frequently-called update used by [`ProgressWriter`]'s flush
    /// loop. Leaves all other job columns untouched.
    async fn update_job_progress(
        &self,
        job_id: &str,
        progress: f64,
        message: Option<&str>,
        state: Option<JobState>,
        error: Option<&str>,
    ) -> StateResult<()>;

    async fn put_idempotency(&self, key: &str, job_id: &str) -> StateResult<()>;
    async fn get_idempotency(&self, key: &str) -> StateResult<Option<(String, DateTime<Utc>)>>;

    async fn put_upload(&self, upload: &UploadSession) -> StateResult<()>;
    async fn get_upload(&self, id: &str) -> StateResult<Option<UploadSession>>;
    async fn delete_upload(&self, id: &str) -> StateResult<()>;
    async fn list_uploads(&self, owner: Option<&str>, include_completed: bool) -> StateResult<Vec<UploadSession>>;

    async fn get_user_quota(&self, user_id: &str) -> StateResult<Option<UserQuotaOverride>>;
    async fn upsert_user_quota(&self, user_id: &str, overrides: &UserQuotaOverride) -> StateResult<()>;

    /// Sum of bytes attributable to a user's completed uploads, used by
    /// [`QuotaEnforcer`] to enforce `max_storage_bytes`.
    async fn get_user_storage_bytes(&self, user_id: &str) -> StateResult<u64>;
}

/// Open the default SQLite-backed store at `path`, running migrations.
pub async fn open(path: &str) -> anyhow::Result<std::sync::Arc<dyn StateStore>> {
    let store = SqliteStateStore::open(path).await?;
    Ok(std::sync::Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_display_and_parse_roundtrip() {
        for s in [
            JobState::Queued,
            JobState::Running,
            JobState::Done,
            JobState::Failed,
            JobState::Canceled,
            JobState::Paused,
        ] {
            let parsed: JobState = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn job_state_terminal_classification() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Paused.is_terminal());
    }

    #[test]
    fn upload_session_missing_chunks_and_sizes() {
        let session = UploadSession {
            id: "u1".into(),
            owner_id: "user1".into(),
            filename: "ep01.mp4".into(),
            total_bytes: 5_242_880,
            chunk_bytes: 1_048_576,
            total_chunks: 5,
            part_path: "/tmp/u1.part".into(),
            final_path: "/tmp/u1_ep01.mp4".into(),
            received: BTreeMap::new(),
            received_bytes: 0,
            completed: false,
            final_sha256: None,
            expected_sha256: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(session.missing_chunks(), vec![0, 1, 2, 3, 4]);
        assert_eq!(session.expected_chunk_size(0), Some(1_048_576));
        assert_eq!(session.expected_chunk_size(4), Some(1_048_576));
        assert_eq!(session.expected_offset(4), 4_194_304);
    }
}

//! SQLite backend implementation for [`StateStore`].
//!
//! WAL journal mode for read/write concurrency, a bounded connection pool,
//! and `sqlx::migrate!` applied on every open. This is the only backend the
//! spec names; there is no feature flag to disable it.

use crate::{
    Device, Job, JobFilter, JobState, LibraryMetadata, Mode, ReceivedChunk, StateError,
    StateResult, StateStore, UploadSession, UserQuotaOverride, Visibility,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::instrument;

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open or create a SQLite database at `path`, running migrations.
    #[instrument(skip(path))]
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{path}")
        };

        if !sqlx::Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(&db_url).await?;
        }

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_job(row: &SqliteRow) -> StateResult<Job> {
    let state_str: String = row.try_get("state")?;
    let state = JobState::from_str(&state_str)?;
    let mode_str: String = row.try_get("mode")?;
    let mode = Mode::from_str(&mode_str)?;
    let device_str: String = row.try_get("device")?;
    let device = Device::from_str(&device_str)?;
    let visibility_str: String = row.try_get("visibility")?;
    let visibility = match visibility_str.as_str() {
        "shared" => Visibility::Shared,
        _ => Visibility::Private,
    };
    let runtime_str: String = row.try_get("runtime")?;
    let runtime = serde_json::from_str::<serde_json::Value>(&runtime_str)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    Ok(Job {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        video_path: row.try_get("video_path")?,
        duration_s: row.try_get("duration_s")?,
        mode,
        device,
        state,
        progress: row.try_get("progress")?,
        message: row.try_get("message")?,
        error: row.try_get("error")?,
        visibility,
        runtime,
        library: LibraryMetadata {
            series_slug: row.try_get("series_slug")?,
            season_number: row.try_get("season_number")?,
            episode_number: row.try_get("episode_number")?,
        },
        created_at: parse_ts(row.try_get("created_at")?)?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
    })
}

fn row_to_upload(row: &SqliteRow) -> StateResult<UploadSession> {
    let received_str: String = row.try_get("received")?;
    let received: BTreeMap<u64, ReceivedChunk> =
        serde_json::from_str(&received_str).unwrap_or_default();

    Ok(UploadSession {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        filename: row.try_get("filename")?,
        total_bytes: row.try_get::<i64, _>("total_bytes")? as u64,
        chunk_bytes: row.try_get::<i64, _>("chunk_bytes")? as u64,
        total_chunks: row.try_get::<i64, _>("total_chunks")? as u64,
        part_path: row.try_get("part_path")?,
        final_path: row.try_get("final_path")?,
        received,
        received_bytes: row.try_get::<i64, _>("received_bytes")? as u64,
        completed: row.try_get::<i64, _>("completed")? != 0,
        final_sha256: row.try_get("final_sha256")?,
        expected_sha256: row.try_get("expected_sha256")?,
        created_at: parse_ts(row.try_get("created_at")?)?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
    })
}

fn parse_ts(s: String) -> StateResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Validation(format!("bad timestamp {s}: {e}")))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip(self, job))]
    async fn put_job(&self, job: &Job) -> StateResult<()> {
        let runtime_json = serde_json::Value::Object(job.runtime.clone()).to_string();
        sqlx::query(
            "INSERT INTO jobs (
                id, owner_id, video_path, duration_s, mode, device, state, progress,
                message, error, visibility, runtime, series_slug, season_number,
                episode_number, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                video_path = excluded.video_path,
                duration_s = excluded.duration_s,
                mode = excluded.mode,
                device = excluded.device,
                state = excluded.state,
                progress = excluded.progress,
                message = excluded.message,
                error = excluded.error,
                visibility = excluded.visibility,
                runtime = excluded.runtime,
                series_slug = excluded.series_slug,
                season_number = excluded.season_number,
                episode_number = excluded.episode_number,
                updated_at = excluded.updated_at",
        )
        .bind(&job.id)
        .bind(&job.owner_id)
        .bind(&job.video_path)
        .bind(job.duration_s)
        .bind(job.mode.to_string())
        .bind(job.device.to_string())
        .bind(job.state.to_string())
        .bind(job.progress)
        .bind(&job.message)
        .bind(&job.error)
        .bind(match job.visibility {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
        })
        .bind(runtime_json)
        .bind(&job.library.series_slug)
        .bind(job.library.season_number)
        .bind(job.library.episode_number)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_job(&self, id: &str) -> StateResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_jobs(&self, limit: usize, filter: &JobFilter) -> StateResult<Vec<Job>> {
        let mut query = String::from("SELECT * FROM jobs WHERE 1=1");
        if filter.owner_id.is_some() {
            query.push_str(" AND owner_id = ?");
        }
        if filter.state.is_some() {
            query.push_str(" AND state = ?");
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut q = sqlx::query(&query);
        if let Some(owner) = &filter.owner_id {
            q = q.bind(owner);
        }
        if let Some(state) = &filter.state {
            q = q.bind(state.to_string());
        }
        q = q.bind(limit as i64);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self))]
    async fn delete_job(&self, id: &str) -> StateResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_job_progress(
        &self,
        job_id: &str,
        progress: f64,
        message: Option<&str>,
        state: Option<JobState>,
        error: Option<&str>,
    ) -> StateResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE jobs SET
                progress = ?,
                message = COALESCE(?, message),
                state = COALESCE(?, state),
                error = COALESCE(?, error),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(progress)
        .bind(message)
        .bind(state.map(|s| s.to_string()))
        .bind(error)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn put_idempotency(&self, key: &str, job_id: &str) -> StateResult<()> {
        sqlx::query(
            "INSERT INTO idempotency_keys (key, job_id, created_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(job_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_idempotency(&self, key: &str) -> StateResult<Option<(String, DateTime<Utc>)>> {
        let row = sqlx::query("SELECT job_id, created_at FROM idempotency_keys WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let job_id: String = r.try_get("job_id")?;
                let created_at: String = r.try_get("created_at")?;
                Ok(Some((job_id, parse_ts(created_at)?)))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, upload))]
    async fn put_upload(&self, upload: &UploadSession) -> StateResult<()> {
        let received_json = serde_json::to_string(&upload.received)
            .map_err(|e| StateError::Validation(e.to_string()))?;

        sqlx::query(
            "INSERT INTO uploads (
                id, owner_id, filename, total_bytes, chunk_bytes, total_chunks,
                part_path, final_path, received, received_bytes, completed,
                final_sha256, expected_sha256, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                received = excluded.received,
                received_bytes = excluded.received_bytes,
                completed = excluded.completed,
                final_sha256 = excluded.final_sha256,
                updated_at = excluded.updated_at",
        )
        .bind(&upload.id)
        .bind(&upload.owner_id)
        .bind(&upload.filename)
        .bind(upload.total_bytes as i64)
        .bind(upload.chunk_bytes as i64)
        .bind(upload.total_chunks as i64)
        .bind(&upload.part_path)
        .bind(&upload.final_path)
        .bind(received_json)
        .bind(upload.received_bytes as i64)
        .bind(upload.completed as i64)
        .bind(&upload.final_sha256)
        .bind(&upload.expected_sha256)
        .bind(upload.created_at.to_rfc3339())
        .bind(upload.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_upload(&self, id: &str) -> StateResult<Option<UploadSession>> {
        let row = sqlx::query("SELECT * FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_upload).transpose()
    }

    #[instrument(skip(self))]
    async fn delete_upload(&self, id: &str) -> StateResult<()> {
        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_uploads(&self, owner: Option<&str>, include_completed: bool) -> StateResult<Vec<UploadSession>> {
        let mut query = String::from("SELECT * FROM uploads WHERE 1=1");
        if owner.is_some() {
            query.push_str(" AND owner_id = ?");
        }
        if !include_completed {
            query.push_str(" AND completed = 0");
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&query);
        if let Some(owner) = owner {
            q = q.bind(owner);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_upload).collect()
    }

    #[instrument(skip(self))]
    async fn get_user_quota(&self, user_id: &str) -> StateResult<Option<UserQuotaOverride>> {
        let row = sqlx::query("SELECT * FROM user_quotas WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(UserQuotaOverride {
                max_running: r.try_get("max_running")?,
                max_queued: r.try_get("max_queued")?,
                jobs_per_day: r.try_get("jobs_per_day")?,
                max_storage_bytes: r.try_get("max_storage_bytes")?,
                max_upload_bytes: r.try_get("max_upload_bytes")?,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, overrides))]
    async fn upsert_user_quota(&self, user_id: &str, overrides: &UserQuotaOverride) -> StateResult<()> {
        sqlx::query(
            "INSERT INTO user_quotas (
                user_id, max_running, max_queued, jobs_per_day, max_storage_bytes,
                max_upload_bytes, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                max_running = excluded.max_running,
                max_queued = excluded.max_queued,
                jobs_per_day = excluded.jobs_per_day,
                max_storage_bytes = excluded.max_storage_bytes,
                max_upload_bytes = excluded.max_upload_bytes,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(overrides.max_running)
        .bind(overrides.max_queued)
        .bind(overrides.jobs_per_day)
        .bind(overrides.max_storage_bytes)
        .bind(overrides.max_upload_bytes)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_user_storage_bytes(&self, user_id: &str) -> StateResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_bytes), 0) as total FROM uploads
             WHERE owner_id = ? AND completed = 1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("total")? as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobFilter;
    use tempfile::NamedTempFile;

    fn sample_job(id: &str, owner: &str) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            owner_id: owner.to_string(),
            video_path: "/data/in.mp4".to_string(),
            duration_s: Some(120.5),
            mode: Mode::Medium,
            device: Device::Auto,
            state: JobState::Queued,
            progress: 0.0,
            message: None,
            error: None,
            visibility: Visibility::Private,
            runtime: serde_json::Map::new(),
            library: LibraryMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn put_and_get_job_roundtrips() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStateStore::open(tmp.path().to_str().unwrap()).await.unwrap();

        let job = sample_job("job-1", "user1");
        store.put_job(&job).await.unwrap();

        let fetched = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "job-1");
        assert_eq!(fetched.state, JobState::Queued);
        assert_eq!(fetched.owner_id, "user1");
    }

    #[tokio::test]
    async fn update_job_progress_is_partial() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStateStore::open(tmp.path().to_str().unwrap()).await.unwrap();

        let job = sample_job("job-1", "user1");
        store.put_job(&job).await.unwrap();

        store
            .update_job_progress("job-1", 0.42, Some("transcoding"), Some(JobState::Running), None)
            .await
            .unwrap();

        let fetched = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(fetched.progress, 0.42);
        assert_eq!(fetched.message.as_deref(), Some("transcoding"));
        assert_eq!(fetched.state, JobState::Running);
    }

    #[tokio::test]
    async fn update_job_progress_missing_job_errors() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStateStore::open(tmp.path().to_str().unwrap()).await.unwrap();

        let result = store.update_job_progress("nope", 0.1, None, None, None).await;
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_jobs_filters_by_owner_and_state() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStateStore::open(tmp.path().to_str().unwrap()).await.unwrap();

        store.put_job(&sample_job("job-1", "user1")).await.unwrap();
        store.put_job(&sample_job("job-2", "user2")).await.unwrap();

        let mut running = sample_job("job-3", "user1");
        running.state = JobState::Running;
        store.put_job(&running).await.unwrap();

        let filter = JobFilter {
            owner_id: Some("user1".to_string()),
            state: None,
        };
        let jobs = store.list_jobs(10, &filter).await.unwrap();
        assert_eq!(jobs.len(), 2);

        let filter = JobFilter {
            owner_id: Some("user1".to_string()),
            state: Some(JobState::Running),
        };
        let jobs = store.list_jobs(10, &filter).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "job-3");
    }

    #[tokio::test]
    async fn idempotency_key_insert_is_conflict_free_on_retry() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStateStore::open(tmp.path().to_str().unwrap()).await.unwrap();

        store.put_idempotency("key-1", "job-1").await.unwrap();
        store.put_idempotency("key-1", "job-2").await.unwrap();

        let (job_id, _) = store.get_idempotency("key-1").await.unwrap().unwrap();
        assert_eq!(job_id, "job-1");
    }

    #[tokio::test]
    async fn user_quota_override_roundtrips() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStateStore::open(tmp.path().to_str().unwrap()).await.unwrap();

        assert!(store.get_user_quota("user1").await.unwrap().is_none());

        let overrides = UserQuotaOverride {
            max_running: Some(5),
            max_queued: None,
            jobs_per_day: Some(100),
            max_storage_bytes: None,
            max_upload_bytes: None,
        };
        store.upsert_user_quota("user1", &overrides).await.unwrap();

        let fetched = store.get_user_quota("user1").await.unwrap().unwrap();
        assert_eq!(fetched.max_running, Some(5));
        assert_eq!(fetched.jobs_per_day, Some(100));
    }
}

//! Job submission, lookup, listing, and cancellation.

use crate::auth::AuthContext;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::HeaderMap,
    Json,
};
use core_jobstate::{Device, Job, JobFilter, JobState, LibraryMetadata, Mode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct CreateJobRequest {
    pub video_path: Option<String>,
    pub upload_id: Option<String>,
    pub mode: Mode,
    pub device: Device,
    pub src_lang: Option<String>,
    pub tgt_lang: Option<String>,
    pub series_title: Option<String>,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}

pub async fn create_job(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<CreateJobResponse>)> {
    if state.drain.is_draining() {
        return Err(ApiError::Draining { retry_after_secs: 30 });
    }

    let video_path = match (&req.video_path, &req.upload_id) {
        (Some(p), _) => p.clone(),
        (None, Some(upload_id)) => {
            let upload = state
                .store
                .get_upload(upload_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("upload {upload_id} not found")))?;
            if !upload.completed {
                return Err(ApiError::Conflict("upload is not complete".into()));
            }
            upload.final_path
        }
        (None, None) => return Err(ApiError::Validation("one of video_path or upload_id is required".into())),
    };

    if let Some(key) = headers.get("Idempotency-Key").and_then(|v| v.to_str().ok()) {
        if let Some((job_id, _)) = state.store.get_idempotency(key).await? {
            return Ok((axum::http::StatusCode::CREATED, Json(CreateJobResponse { id: job_id })));
        }
    }

    let reservation = state.quota.reserve_daily_job(&ctx.user_id, ctx.role).await?;

    let existing = state
        .store
        .list_jobs(usize::MAX, &JobFilter { owner_id: Some(ctx.user_id.clone()), state: None })
        .await?;
    let running = existing.iter().filter(|j| j.state == JobState::Running).count() as i64;
    let queued = existing.iter().filter(|j| j.state == JobState::Queued).count() as i64;
    state.quota.check_concurrent_jobs(&ctx.user_id, ctx.role, running, queued).await?;

    let job_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now();
    let job = Job {
        id: job_id.clone(),
        owner_id: ctx.user_id.clone(),
        video_path,
        duration_s: None,
        mode: req.mode,
        device: req.device,
        state: JobState::Queued,
        progress: 0.0,
        message: None,
        error: None,
        visibility: core_jobstate::Visibility::Private,
        runtime: serde_json::Map::new(),
        library: LibraryMetadata {
            series_slug: req.series_title.clone(),
            season_number: req.season_number,
            episode_number: req.episode_number,
        },
        created_at: now,
        updated_at: now,
    };

    state.store.put_job(&job).await?;

    let mut meta = HashMap::new();
    if let Some(src) = &req.src_lang {
        meta.insert("src_lang".to_string(), src.clone());
    }
    if let Some(tgt) = &req.tgt_lang {
        meta.insert("tgt_lang".to_string(), tgt.clone());
    }

    if let Err(e) = state.queue.submit_job(&job_id, &ctx.user_id, req.mode, req.device, req.priority, meta).await {
        state.store.delete_job(&job_id).await.ok();
        reservation.release().await;
        return Err(e.into());
    }

    if let Some(key) = headers.get("Idempotency-Key").and_then(|v| v.to_str().ok()) {
        state.store.put_idempotency(key, &job_id).await?;
    }

    state.audit.record(
        orbit_core_audit::AuditEvent::new("job.submitted").with_user(ctx.user_id.clone()).with_job(job_id.clone()),
    );
    state.events.publish(crate::state::JobEvent {
        job_id: job_id.clone(),
        state: JobState::Queued.to_string(),
        progress: 0.0,
        message: None,
    });
    state.notify.notify_waiters();

    reservation.keep();

    Ok((axum::http::StatusCode::CREATED, Json(CreateJobResponse { id: job_id })))
}

pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult<Json<Job>> {
    let job = state.store.get_job(&job_id).await?.ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;
    Ok(Json(job))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(q): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let owner = if ctx.role == core_jobstate::Role::Admin { None } else { Some(ctx.user_id.clone()) };
    let filter = JobFilter { owner_id: owner, state: q.state };
    let jobs = state.store.list_jobs(q.limit.unwrap_or(100), &filter).await?;
    Ok(Json(jobs))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> ApiResult<axum::http::StatusCode> {
    let job = state.store.get_job(&job_id).await?.ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;
    if job.owner_id != ctx.user_id && ctx.role != core_jobstate::Role::Admin {
        return Err(ApiError::Forbidden("not the job owner".into()));
    }

    state.queue.cancel_job(&job_id, Some(&ctx.user_id)).await?;
    state.audit.record(orbit_core_audit::AuditEvent::new("job.cancel_requested").with_user(ctx.user_id).with_job(job_id));

    Ok(axum::http::StatusCode::ACCEPTED)
}

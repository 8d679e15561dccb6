//! Admin-only endpoints: queue inspection, priority overrides, quota upserts.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use core_jobstate::UserQuotaOverride;
use core_queue::AdminSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub limit: Option<usize>,
}

pub async fn admin_queue(State(state): State<AppState>, Query(q): Query<QueueQuery>) -> ApiResult<Json<AdminSnapshot>> {
    let snapshot = state.queue.admin_snapshot(q.limit.unwrap_or(100)).await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct SetPriorityRequest {
    pub priority: i64,
}

pub async fn set_priority(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<SetPriorityRequest>,
) -> ApiResult<()> {
    let applied = state.queue.admin_set_priority(&job_id, req.priority).await?;
    if !applied {
        return Err(ApiError::Conflict(format!("job {job_id} is not pending")));
    }
    state.audit.record(
        orbit_core_audit::AuditEvent::new("admin.priority_changed")
            .with_job(job_id)
            .with_meta("priority", req.priority),
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SetQuotasRequest {
    pub max_running: Option<i64>,
    pub max_queued: Option<i64>,
    pub jobs_per_day: Option<i64>,
    pub max_storage_bytes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SetQuotasResponse {
    pub max_running: Option<i64>,
    pub max_queued: Option<i64>,
}

pub async fn set_quotas(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<SetQuotasRequest>,
) -> ApiResult<Json<SetQuotasResponse>> {
    let overrides = UserQuotaOverride {
        max_running: req.max_running,
        max_queued: req.max_queued,
        jobs_per_day: req.jobs_per_day,
        max_storage_bytes: req.max_storage_bytes,
        max_upload_bytes: None,
    };
    state.quota.set_user_overrides(&user_id, &overrides).await?;
    let counts = state.queue.admin_set_user_quotas(&user_id, req.max_running, req.max_queued).await?;

    state.audit.record(orbit_core_audit::AuditEvent::new("admin.quota_overridden").with_user(user_id));

    Ok(Json(SetQuotasResponse { max_running: counts.max_running, max_queued: counts.max_queued }))
}

//! Resumable chunked upload endpoints, sitting on top of
//! [`core_jobstate::upload::UploadSessionManager`].

use crate::auth::AuthContext;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

const DEFAULT_CHUNK_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct InitUploadRequest {
    pub filename: String,
    pub total_bytes: u64,
    #[allow(dead_code)]
    pub mime: Option<String>,
    pub expected_sha256: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub chunk_bytes: u64,
    pub total_chunks: u64,
}

pub async fn init_upload(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<InitUploadRequest>,
) -> ApiResult<(StatusCode, Json<InitUploadResponse>)> {
    if req.total_bytes == 0 {
        return Err(ApiError::Validation("total_bytes must be greater than zero".into()));
    }

    state.quota.check_upload_bytes(&ctx.user_id, ctx.role, req.total_bytes).await?;

    // Reserve against the user's cumulative storage cap for the lifetime of
    // the upload; released on `complete_upload` (bytes become real storage,
    // tracked by `StateStore::get_user_storage_bytes` from then on) or by the
    // retention sweeper if the upload is abandoned.
    let reservation = state.quota.reserve_storage_bytes(&ctx.user_id, ctx.role, req.total_bytes).await?;

    let chunk_bytes = std::env::var("UPLOAD_CHUNK_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CHUNK_BYTES);

    let session = match state
        .uploads
        .init(&ctx.user_id, &req.filename, req.total_bytes, chunk_bytes, req.expected_sha256)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            reservation.release().await;
            return Err(e.into());
        }
    };

    state.reservations.lock().await.insert(session.id.clone(), reservation);

    Ok((
        StatusCode::CREATED,
        Json(InitUploadResponse {
            upload_id: session.id,
            chunk_bytes: session.chunk_bytes,
            total_chunks: session.total_chunks,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub index: u64,
    #[allow(dead_code)]
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ChunkResponse {
    pub received_bytes: u64,
    pub dedup: bool,
}

pub async fn put_chunk(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Query(q): Query<ChunkQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Json<ChunkResponse>> {
    let sha = headers
        .get("X-Chunk-Sha256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation("missing X-Chunk-Sha256 header".into()))?;

    let acceptance = state.uploads.put_chunk(&upload_id, q.index, &body, sha).await?;

    let session = state
        .store
        .get_upload(&upload_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upload {upload_id} not found")))?;

    Ok(Json(ChunkResponse {
        received_bytes: session.received_bytes,
        dedup: acceptance == core_jobstate::upload::ChunkAcceptance::Duplicate,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteUploadRequest {
    #[allow(dead_code)]
    pub final_sha256: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteUploadResponse {
    pub video_path: String,
    pub final_sha256: Option<String>,
}

pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Json(_req): Json<CompleteUploadRequest>,
) -> ApiResult<Json<CompleteUploadResponse>> {
    let session = state.uploads.complete(&upload_id).await?;

    if let Some(reservation) = state.reservations.lock().await.remove(&upload_id) {
        reservation.release().await;
    }

    state.audit.record(orbit_core_audit::AuditEvent::new("upload.completed").with_meta("upload_id", &upload_id));

    Ok(Json(CompleteUploadResponse { video_path: session.final_path, final_sha256: session.final_sha256 }))
}

#[derive(Debug, Serialize)]
pub struct UploadStatusResponse {
    pub state: &'static str,
    pub bytes_received: u64,
    pub next_expected_chunk: Option<u64>,
}

pub async fn upload_status(State(state): State<AppState>, Path(upload_id): Path<String>) -> ApiResult<Json<UploadStatusResponse>> {
    let session = state
        .store
        .get_upload(&upload_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upload {upload_id} not found")))?;

    let next_expected = session.missing_chunks().into_iter().next();

    Ok(Json(UploadStatusResponse {
        state: if session.completed { "complete" } else { "in_progress" },
        bytes_received: session.received_bytes,
        next_expected_chunk: next_expected,
    }))
}

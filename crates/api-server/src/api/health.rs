//! Liveness, readiness, and Prometheus metrics endpoints.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub draining: bool,
}

/// `/readyz` reports `false` while draining or while the StateStore is
/// unreachable, so a load balancer stops routing new traffic here without
/// killing in-flight jobs.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let draining = state.drain.is_draining();
    let store_ok = state
        .store
        .list_jobs(1, &core_jobstate::JobFilter::default())
        .await
        .is_ok();
    let ready = !draining && store_ok;

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(ReadyResponse { ready, draining }))
}

/// Prometheus text exposition. Queue-depth/lock/quota-denial counters live
/// on the queue backend and quota enforcer; this handler only renders them.
pub async fn metrics(State(state): State<AppState>) -> String {
    let counts = state.queue.global_counts().await.unwrap_or_default();
    let status = state.queue.status();

    format!(
        "# HELP dubtrack_jobs_running Jobs currently running\n\
         # TYPE dubtrack_jobs_running gauge\n\
         dubtrack_jobs_running {}\n\
         # HELP dubtrack_jobs_queued Jobs currently queued\n\
         # TYPE dubtrack_jobs_queued gauge\n\
         dubtrack_jobs_queued {}\n\
         # HELP dubtrack_coordinator_healthy Whether the queue coordinator is reachable\n\
         # TYPE dubtrack_coordinator_healthy gauge\n\
         dubtrack_coordinator_healthy {}\n\
         # HELP dubtrack_draining Whether the process is draining\n\
         # TYPE dubtrack_draining gauge\n\
         dubtrack_draining {}\n",
        counts.running,
        counts.queued,
        if status.coordinator_healthy { 1 } else { 0 },
        if state.drain.is_draining() { 1 } else { 0 },
    )
}

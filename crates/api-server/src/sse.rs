//! Server-sent job progress stream (`GET /events/jobs/{id}`), replacing the
//! teacher's WebSocket broadcast with a per-job SSE stream per SPEC_FULL §6.5.
//!
//! Grounded on `ws.rs`'s `handle_socket`: same subscribe-then-filter-by-role-
//! and-job-id shape, same "keep the connection's auth context for its
//! lifetime" pattern, adapted from a bidirectional socket to a one-way event
//! stream that terminates once the job reaches a terminal state.

use crate::state::AppState;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;

pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();
    let store = state.store.clone();

    let initial = store.get_job(&job_id).await.ok().flatten();

    let stream = async_stream::stream! {
        if let Some(job) = &initial {
            if let Ok(json) = serde_json::to_string(job) {
                yield Ok(Event::default().data(json));
            }
            if job.state.is_terminal() {
                return;
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) if event.job_id == job_id => {
                    let terminal = matches!(
                        event.state.as_str(),
                        "DONE" | "FAILED" | "CANCELED"
                    );
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                    if terminal {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(Box::pin(stream) as std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
}

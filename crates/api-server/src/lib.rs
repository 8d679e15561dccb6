//! HTTP API for the dubbing job orchestration service.
//!
//! Ties together auth (JWT + API keys), resumable uploads, job submission
//! and lifecycle, admin controls, SSE progress streams, and the background
//! `JobExecutor`/`RetentionSweeper` loops into one Axum application.

pub mod api;
pub mod auth;
pub mod boot;
pub mod error;
pub mod executor;
pub mod retention;
pub mod server;
pub mod sse;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Top-level server configuration, assembled from environment variables by
/// `main.rs` (see SPEC_FULL.md §6.3 for the full variable list).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub state_dir: String,
    pub user_db: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            state_dir: "state".to_string(),
            user_db: "dubtrack-users.db".to_string(),
        }
    }
}

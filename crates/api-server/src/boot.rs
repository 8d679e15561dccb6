//! Shared process bootstrap: reads environment variables (SPEC_FULL.md
//! §6.3), opens the durable state store, and builds an [`AppState`] plus the
//! pieces `server::run_server` needs. Used by both this crate's own
//! `src/main.rs` binary and the root `dubtrack` CLI's `serve` subcommand, so
//! the two never drift on how a process is wired up.

use crate::executor::PlaceholderDubbingPipeline;
use crate::state::{build_auto_queue, default_quota_defaults, AppState};
use crate::{executor::DubbingPipeline, server, ServerConfig};
use core_jobstate::config::ConcurrencyConfig;
use core_jobstate::quota::QuotaEnforcer;
use core_jobstate::upload::UploadSessionManager;
use orbit_core_audit::AuditLog;
use sqlx::SqlitePool;
use std::{env, sync::Arc};

/// Reads `ServerConfig` straight from the environment.
pub fn config_from_env() -> ServerConfig {
    ServerConfig {
        host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080),
        state_dir: env::var("STATE_DIR").unwrap_or_else(|_| "state".to_string()),
        user_db: env::var("USER_DB").unwrap_or_else(|_| "dubtrack-users.db".to_string()),
    }
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Opens the `StateStore`, auth database, and every other piece of
/// long-lived state a process needs, per SPEC_FULL §6.4's persistent state
/// layout. Shared by `serve`, `retention run-once`, and `migrate` — all of
/// them need the same databases open before doing anything else.
pub async fn open_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("JWT_SECRET not set, using insecure default! Set it in production.");
        "insecure-default-secret".to_string()
    });

    let output_dir = env::var("OUTPUT_DIR").unwrap_or_else(|_| "output".to_string());
    let input_dir = env::var("INPUT_DIR").unwrap_or_else(|_| "uploads".to_string());

    std::fs::create_dir_all(&config.state_dir)?;
    std::fs::create_dir_all(&output_dir)?;
    std::fs::create_dir_all(&input_dir)?;

    let state_db_path = format!("{}/jobs.db", config.state_dir);
    let store = core_jobstate::open(&state_db_path).await?;

    let queue = build_auto_queue(store.clone());

    let quota = Arc::new(QuotaEnforcer::new(store.clone(), default_quota_defaults()));
    let uploads = Arc::new(UploadSessionManager::new(store.clone(), input_dir.clone()));

    let audit_path = format!("{}/audit.jsonl", config.state_dir);
    let audit = AuditLog::open(&audit_path)?;

    let user_pool = SqlitePool::connect(&format!("sqlite:{}/{}?mode=rwc", config.state_dir, config.user_db)).await?;
    crate::auth::init_user_db(&user_pool).await?;
    crate::auth::ensure_default_admin(&user_pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to seed default admin: {e}"))?;

    Ok(AppState::new(store, queue, quota, uploads, audit, user_pool, jwt_secret))
}

pub fn worker_count_from_env() -> usize {
    env::var("WORKER_COUNT")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(ConcurrencyConfig::new)
        .unwrap_or_else(ConcurrencyConfig::auto_detect)
        .worker_threads
}

/// Runs the full HTTP API process: opens state, spawns the `JobExecutor`
/// pool and `RetentionSweeper`, and serves until a drained graceful
/// shutdown completes. This is what both binaries' `serve` path calls.
pub async fn serve() -> anyhow::Result<()> {
    let config = config_from_env();
    let state = open_state(&config).await?;
    let worker_count = worker_count_from_env();
    let pipeline: Arc<dyn DubbingPipeline> = Arc::new(PlaceholderDubbingPipeline);

    tracing::info!(host = %config.host, port = config.port, worker_count, "starting dubtrack api-server");

    server::run_server(config, state, pipeline, worker_count).await
}

//! `dubtrack` CLI: run the API server, run a retention sweep once, or apply
//! schema migrations. See SPEC_FULL.md §6.2-§6.3 for the subcommand and
//! environment-variable contracts.

use clap::{Parser, Subcommand};
use dubtrack::ExitCode;

#[derive(Parser)]
#[command(name = "dubtrack", version, about = "Multi-tenant dubbing job orchestration service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and background worker/retention loops until a
    /// drained shutdown.
    Serve,
    /// Retention sweeping: abandoned uploads, expired job artifacts, old logs.
    Retention {
        #[command(subcommand)]
        action: RetentionAction,
    },
    /// Open the state store, applying any pending schema migrations, then exit.
    Migrate,
}

#[derive(Subcommand)]
enum RetentionAction {
    /// Run one sweep pass immediately and print a summary, instead of
    /// waiting for the periodic background loop.
    RunOnce,
}

#[tokio::main]
async fn main() {
    api_server::boot::init_tracing();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve => api_server::boot::serve().await,
        Command::Retention { action: RetentionAction::RunOnce } => retention_run_once().await,
        Command::Migrate => migrate().await,
    };

    if let Err(err) = result {
        let code = ExitCode::from_error(&err);
        eprintln!("error: {err:#}");
        std::process::exit(code as i32);
    }
}

async fn retention_run_once() -> anyhow::Result<()> {
    let config = api_server::boot::config_from_env();
    let state = api_server::boot::open_state(&config).await?;

    let output_dir: std::path::PathBuf = std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "output".to_string()).into();
    let input_dir: std::path::PathBuf = std::env::var("INPUT_DIR").unwrap_or_else(|_| "uploads".to_string()).into();
    let logs_dir: std::path::PathBuf = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string()).into();

    let sweeper = api_server::retention::RetentionSweeper::new(
        state.store.clone(),
        state.audit.clone(),
        api_server::retention::RetentionConfig::from_env(output_dir, input_dir, logs_dir),
    )
    .with_reservations(state.reservations.clone());

    let summary = sweeper.run_once().await;
    println!(
        "uploads_removed={} jobs_removed={} logs_removed={} bytes_freed={}",
        summary.uploads_removed, summary.jobs_removed, summary.logs_removed, summary.bytes_freed
    );

    Ok(())
}

async fn migrate() -> anyhow::Result<()> {
    let config = api_server::boot::config_from_env();
    // `core_jobstate::open` runs `sqlx::migrate!` unconditionally, so opening
    // the store once is the migration.
    let _state = api_server::boot::open_state(&config).await?;
    println!("migrations applied ({}/jobs.db)", config.state_dir);
    Ok(())
}

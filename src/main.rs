//! # Follow-up Scheduler Entry Point
//!
//! `serve` runs the HTTP API (optionally with the embedded worker), `worker`
//! runs the dispatch loop on its own, and `migrate` applies migrations and exits.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use followups::{
    config::{AppConfig, ConfigLoader},
    db,
    dispatcher::PassStats,
    server,
    telemetry::init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "followups", version, about = "Follow-up email scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Run the dispatch worker
    Worker {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        /// Override the tick interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let mut config = ConfigLoader::new().load()?;
    init_tracing(&config)?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let db = db::connect_and_migrate(&config).await?;
            server::run_server(config, db).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Worker { once, interval } => {
            if let Some(secs) = interval {
                config.worker.tick_interval_seconds = secs;
                config.worker.validate()?;
            }
            Ok(run_worker(config, once).await?)
        }
        Command::Migrate => {
            let db = db::init_pool(&config).await?;
            db::run_migrations(&db).await?;
            tracing::info!("Migrations applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Exit status of a single pass, so cron callers can spot failed sends.
fn pass_exit_code(stats: &PassStats) -> u8 {
    if stats.has_failures() {
        1
    } else {
        0
    }
}

async fn run_worker(config: AppConfig, once: bool) -> anyhow::Result<ExitCode> {
    let db = db::connect_and_migrate(&config).await?;
    let state = server::AppState::from_config(Arc::new(config), db)?;

    if once {
        let stats = state
            .dispatcher
            .run_once()
            .await
            .context("dispatch pass failed")?;
        if stats.has_failures() {
            tracing::warn!(?stats, "Single dispatch pass finished with failures");
        } else {
            tracing::info!(?stats, "Single dispatch pass finished");
        }
        return Ok(ExitCode::from(pass_exit_code(&stats)));
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        signal_token.cancel();
    });

    state.dispatcher.run(shutdown).await;
    Ok(ExitCode::SUCCESS)
}

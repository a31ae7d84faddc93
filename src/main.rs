//! clinic-sync - Offline-first record synchronization for clinic field devices
//!
//! This is the main entry point for the clinic-sync application.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use clinic_sync::config::Config;
use clinic_sync::models::EntityType;
use clinic_sync::sync::{
    spawn_reachability_probe, ConnectivityMonitor, SchedulerState, SyncEngine, TokioJobRuntime,
};
use clinic_sync::telemetry::init_tracing;

/// clinic-sync - Offline-first record synchronization for clinic field devices
#[derive(Parser, Debug)]
#[command(name = "clinic-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CLINIC_SYNC_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync scheduler until interrupted (default)
    Run,
    /// Run one sync pass now and print its result
    Sync,
    /// Print connectivity and unsynced counts
    Status,
    /// Store a new pending record
    Enqueue {
        /// Entity type, e.g. patient or vitals
        entity: EntityType,
        /// Record payload as JSON
        payload: String,
    },
    /// Delete synced records older than the retention window
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Initialize tracing/logging
    init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting clinic-sync");

    let monitor = Arc::new(ConnectivityMonitor::default());
    let engine = SyncEngine::from_config(&config, monitor.clone()).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&config, engine, monitor).await,
        Command::Sync => {
            let result = engine.sync_now().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            info!(
                succeeded = result.total_succeeded(),
                failed = result.total_failed(),
                "Sync pass finished"
            );
            Ok(())
        }
        Command::Status => {
            let state = clinic_sync::sync::probe_once(
                &config.remote.base_url,
                std::time::Duration::from_millis(config.connectivity.probe_timeout_ms),
            )
            .await;
            monitor.report(state);

            let status = engine.get_sync_status().await?;
            let counts = engine.get_unsynced_count().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Command::Enqueue { entity, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let record = engine.enqueue(entity, payload).await?;
            println!("{}", record.local_id);
            Ok(())
        }
        Command::Prune => {
            let deleted = engine.prune_synced().await?;
            println!("{}", deleted);
            Ok(())
        }
    }
}

/// Run the scheduler and reachability probe until a shutdown signal
async fn run(
    config: &Config,
    engine: SyncEngine,
    monitor: Arc<ConnectivityMonitor>,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let state_path = scheduler_state_path(config);
    let initial = match &state_path {
        Some(path) => SchedulerState::load(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable scheduler state");
            SchedulerState::default()
        }),
        None => SchedulerState::default(),
    };
    info!(
        consecutive_failures = initial.consecutive_failures,
        "Scheduler state loaded"
    );

    let runtime = Arc::new(TokioJobRuntime::new(monitor.clone()));
    engine
        .start_scheduler(runtime, config.scheduler.clone(), initial)
        .await;

    // Started after the scheduler so the first reachable probe counts as a reconnect
    let probe = spawn_reachability_probe(
        monitor,
        engine.remote_config_handle(),
        config.connectivity.clone(),
        shutdown_rx,
    );

    info!(
        base_url = %config.remote.base_url,
        interval_secs = config.scheduler.periodic_interval_secs,
        "Sync scheduler running"
    );

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    if let Err(e) = probe.await {
        warn!(error = %e, "Reachability probe ended abnormally");
    }

    match engine.stop_scheduler().await {
        Some(state) => {
            info!(
                passes = state.passes_completed,
                consecutive_failures = state.consecutive_failures,
                "Sync scheduler stopped"
            );
            if let Some(path) = &state_path {
                if let Err(e) = state.save(path) {
                    error!(path = %path.display(), error = %e, "Failed to save scheduler state");
                }
            }
        }
        None => warn!("Sync scheduler was not running"),
    }

    info!("clinic-sync shutdown complete");
    Ok(())
}

/// Scheduler state file kept next to the database; none for in-memory databases
fn scheduler_state_path(config: &Config) -> Option<PathBuf> {
    if config.database.path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(&config.database.path).with_extension("scheduler.json"))
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let config = match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path)
        }
        None => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from environment variables");
            Config::from_env()
        }
    }
    .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;
    Ok(config)
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

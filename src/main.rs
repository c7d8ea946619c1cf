#![forbid(unsafe_code)]

//! `fleet-coordinator` daemon binary.
//!
//! Bootstraps configuration, loads durable state, recovers from the
//! previous run, and serves the worker protocol over local IPC until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use fleet_coordinator::config::GlobalConfig;
use fleet_coordinator::ipc::server::spawn_ipc_server;
use fleet_coordinator::orchestrator::Orchestrator;
use fleet_coordinator::pool::{EmailPool, LocationPool};
use fleet_coordinator::queue::{SystemClock, TaskQueue};
use fleet_coordinator::store::{StateStore, StoreOptions};
use fleet_coordinator::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fleet-coordinator", about = "Device fleet task coordinator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the data directory from the configuration file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("fleet-coordinator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config = config.with_data_dir(data_dir)?;
    }
    let config = Arc::new(config);
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    // ── Load durable state ──────────────────────────────
    let store = Arc::new(StateStore::new(StoreOptions::from_config(&config)));
    let source = store.initialize().await?;
    info!(?source, "state loaded");

    let queue = Arc::new(TaskQueue::from_config(
        Arc::clone(&store),
        Arc::new(SystemClock),
        &config.queue,
    ));
    let locations = LocationPool::from_config(Arc::clone(&store), &config.pools);
    let emails = EmailPool::from_config(Arc::clone(&store), &config.pools);
    seed_pools(&config, &locations, &emails).await;

    let (orchestrator, events_rx) = Orchestrator::new(
        Arc::clone(&config),
        Arc::clone(&store),
        queue,
        locations,
        emails,
    );
    let orchestrator = Arc::new(orchestrator);

    // ── Recover from the previous run ───────────────────
    let report = orchestrator.recover().await?;
    if !report.reclaimed.is_empty() || report.interrupted_sessions > 0 {
        warn!(
            reclaimed = report.reclaimed.len(),
            interrupted = report.interrupted_sessions,
            "recovered work from an unclean shutdown"
        );
    }

    // ── Start background services ───────────────────────
    let ct = CancellationToken::new();
    store
        .spawn_auto_save(Duration::from_secs(config.store.auto_save_seconds.max(1)))
        .await;
    let mut handles = orchestrator.spawn_background(events_rx, &ct);
    handles.push(spawn_ipc_server(
        Arc::clone(&orchestrator),
        config.ipc_name.clone(),
        ct.clone(),
    )?);

    info!(ipc_name = %config.ipc_name, "fleet-coordinator ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    orchestrator.shutdown().await;
    ct.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            error!(%err, "background task panicked");
        }
    }

    // ── Final save ──────────────────────────────────────
    if let Err(err) = store.shutdown().await {
        error!(%err, "final state save failed");
        return Err(err);
    }
    info!("fleet-coordinator shut down");

    Ok(())
}

/// Load configured seed files into the pools. Failures are logged; the
/// daemon keeps running with whatever the pools already hold.
async fn seed_pools(config: &GlobalConfig, locations: &LocationPool, emails: &EmailPool) {
    if let Some(path) = &config.pools.locations_csv {
        match locations.load_locations_csv(path).await {
            Ok(added) => info!(added, path = %path.display(), "location seed loaded"),
            Err(err) => error!(%err, path = %path.display(), "failed to load location seed"),
        }
    }
    if let Some(path) = &config.pools.emails_file {
        match emails.load_emails_file(path).await {
            Ok(added) => info!(added, path = %path.display(), "email seed loaded"),
            Err(err) => error!(%err, path = %path.display(), "failed to load email seed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

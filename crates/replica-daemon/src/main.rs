//! replica-daemon: headless replication daemon.
//!
//! Keeps a directory-backed local store in sync with a remote one, using the
//! same replica-core as every other client process, and coordinates with
//! other processes started on the same data directory.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use replica_core::store::DocumentStore;
use replica_core::OriginId;
use replica_daemon::{load_config, Daemon, DaemonOptions};

#[derive(Parser, Debug)]
#[command(name = "replica-daemon")]
#[command(about = "Offline-first document replication daemon")]
struct Args {
    /// Directory holding the local store, sync state and shared slot
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Directory of the remote store (runs offline when absent)
    #[arg(short, long)]
    remote_dir: Option<PathBuf>,

    /// JSON config file; missing fields take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Process origin id, 16 hex chars (generated if not provided)
    #[arg(long)]
    origin_id: Option<String>,

    /// Claim the timer session on start
    #[arg(long)]
    session_owner: bool,

    /// Seconds between scheduled sync cycles
    #[arg(long, default_value_t = 60)]
    sync_interval: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,replica_daemon=debug"
    } else {
        "info,replica_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting replica-daemon");
    info!("Data directory: {:?}", args.data_dir);

    let origin = match &args.origin_id {
        Some(raw) => raw
            .parse::<OriginId>()
            .with_context(|| format!("Invalid origin id {:?}", raw))?,
        None => {
            let id = OriginId::generate();
            info!("Generated origin id: {}", id);
            id
        }
    };
    let config = load_config(args.config.as_deref())?;

    let daemon = Daemon::start(DaemonOptions {
        data_dir: args.data_dir.clone(),
        remote_dir: args.remote_dir.clone(),
        config,
        origin,
        session_owner: args.session_owner,
    })
    .await?;

    let mut status_rx = daemon.orchestrator().subscribe_status();
    let mut incoming = daemon.hub().subscribe();
    let mut changes = daemon.local().watch();
    let mut schedule = tokio::time::interval(Duration::from_secs(args.sync_interval.max(1)));

    info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            // Scheduled cycle (the first tick fires immediately)
            _ = schedule.tick() => {
                daemon.sync().await;
            }

            Ok(()) = status_rx.changed() => {
                let status = *status_rx.borrow_and_update();
                daemon.on_status_changed(status).await;
            }

            // Events from other processes
            Some(event) = incoming.recv() => {
                daemon.on_incoming(event).await;
            }

            // Writes to the local store
            result = changes.recv() => match result {
                Ok(change) => daemon.on_local_change(change).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} local change(s), syncing", skipped);
                    daemon.sync().await;
                }
                Err(RecvError::Closed) => break,
            },

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    daemon.shutdown().await
}

//! Daemon state holding all components, and the handlers the main loop
//! dispatches to.
//!
//! Data directory layout:
//! - `store/` - the local document store ([`DirStore`])
//! - `state/` - offline queue, ledger and metrics ([`JsonStateStore`])
//! - `slot/` - cross-process messages ([`FileSlot`]); every process started
//!   on the same data directory joins the same coordination group

use crate::dir_store::DirStore;
use crate::file_slot::FileSlot;
use crate::persistence::JsonStateStore;
use anyhow::{Context, Result};
use replica_core::message::ChannelEvent;
use replica_core::store::Change;
use replica_core::{
    system_clock, CoordinationHub, IncomingEvent, OriginId, StoreTransport, SyncConfig, SyncError,
    SyncOrchestrator, SyncStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub data_dir: PathBuf,
    /// Directory of the remote store. `None` keeps the daemon offline.
    pub remote_dir: Option<PathBuf>,
    pub config: SyncConfig,
    pub origin: OriginId,
    /// Claim the timer session on start.
    pub session_owner: bool,
}

pub struct Daemon {
    local: Arc<DirStore>,
    orchestrator: SyncOrchestrator,
    hub: CoordinationHub,
}

impl Daemon {
    /// Open stores, start the orchestrator and join the coordination group.
    pub async fn start(options: DaemonOptions) -> Result<Self> {
        let DaemonOptions {
            data_dir,
            remote_dir,
            config,
            origin,
            session_owner,
        } = options;

        let local = Arc::new(
            DirStore::open(data_dir.join("store"))
                .await
                .context("Failed to open local store")?,
        );
        let state = Arc::new(
            JsonStateStore::open(data_dir.join("state"))
                .await
                .context("Failed to open state directory")?,
        );

        let mut builder = SyncOrchestrator::builder(local.clone(), state).config(config.clone());
        if let Some(remote_dir) = &remote_dir {
            let remote = DirStore::open(remote_dir)
                .await
                .with_context(|| format!("Failed to open remote store {}", remote_dir.display()))?;
            builder = builder.remote(Arc::new(StoreTransport::new(Arc::new(remote))));
            info!("Remote store: {:?}", remote_dir);
        } else {
            info!("No remote configured, running offline");
        }
        let orchestrator = builder.build();
        orchestrator
            .init()
            .await
            .context("Failed to initialize sync orchestrator")?;

        let slot = FileSlot::open(data_dir.join("slot"), origin)
            .context("Failed to open shared slot")?;
        let hub = CoordinationHub::new(origin, Arc::new(slot), &config, system_clock());
        hub.init();

        if session_owner {
            match hub.claim_leadership().await {
                Ok(true) => info!("{} owns the timer session", origin),
                Ok(false) => info!("Another process owns the timer session"),
                Err(e) => warn!("Failed to claim session for {}: {}", origin, e),
            }
        }

        Ok(Self {
            local,
            orchestrator,
            hub,
        })
    }

    pub fn local(&self) -> &Arc<DirStore> {
        &self.local
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn hub(&self) -> &CoordinationHub {
        &self.hub
    }

    /// Run one sync cycle and log the outcome. Refusals are expected here.
    pub async fn sync(&self) {
        match self.orchestrator.sync().await {
            Ok(report) => debug!(
                "Synced: {} pushed, {} pulled, {} pending conflict(s)",
                report.pushed, report.pulled, report.pending_conflicts
            ),
            Err(
                SyncError::AlreadySyncing
                | SyncError::Throttled { .. }
                | SyncError::Offline
                | SyncError::Paused
                | SyncError::CircuitOpen,
            ) => {}
            Err(e) => error!("Failed to sync: {}", e),
        }
    }

    /// Tell the other processes about a status change.
    pub async fn on_status_changed(&self, status: SyncStatus) {
        info!("Sync status: {}", status);
        let event = ChannelEvent::SyncStatus {
            status: status.to_string(),
        };
        if let Err(e) = self.hub.broadcast(event).await {
            warn!("Failed to broadcast status {}: {}", status, e);
        }
    }

    /// Handle an event from another process.
    pub async fn on_incoming(&self, event: IncomingEvent) {
        match &event.payload {
            ChannelEvent::DocumentChanged { id, rev, .. } => {
                debug!(
                    "{} changed {} ({})",
                    event.origin_id,
                    id,
                    rev.as_deref().unwrap_or("-")
                );
            }
            ChannelEvent::DocumentDeleted { id } => {
                debug!("{} deleted {}", event.origin_id, id);
            }
            ChannelEvent::SyncStatus { status } => {
                debug!("{} is {}", event.origin_id, status);
            }
            ChannelEvent::SessionClaim(state) | ChannelEvent::SessionHeartbeat(state) => {
                debug!(
                    "Session owned by {} (running: {})",
                    state.leader_id, state.session_state.running
                );
            }
            ChannelEvent::SessionReleased { leader_id } => {
                info!("{} released the timer session", leader_id);
            }
            ChannelEvent::SettingsChanged { key, .. } => {
                info!("{} changed setting {}", event.origin_id, key);
            }
        }
    }

    /// Handle a write to the local store: notify the other processes and
    /// replicate.
    pub async fn on_local_change(&self, change: Change) {
        let event = if change.deleted {
            ChannelEvent::DocumentDeleted {
                id: change.id.clone(),
            }
        } else {
            ChannelEvent::DocumentChanged {
                id: change.id.clone(),
                rev: Some(change.rev.to_string()),
                fields: Vec::new(),
            }
        };
        if let Err(e) = self.hub.broadcast(event).await {
            warn!("Failed to broadcast change for {}: {}", change.id, e);
        }
        self.sync().await;
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.hub.shutdown().await;
        self.orchestrator
            .shutdown()
            .await
            .context("Failed to shut down sync orchestrator")?;
        Ok(())
    }
}

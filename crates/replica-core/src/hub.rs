//! CoordinationHub: the per-process face of the cross-process layer.
//!
//! Combines the channel, the outgoing batcher and session-owner election.
//! Application events go through the batcher; session traffic (claims,
//! heartbeats, releases) is sent directly so heartbeats keep their period.
//! Every message from another process is fed to the election first and then
//! fanned out to subscribers as an [`IncomingEvent`].

use crate::batcher::{BatchStats, MessageBatcher};
use crate::channel::{CrossTabChannel, SharedSlot};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, Subscription};
use crate::leader::{LeaderElection, Transition};
use crate::message::{ChannelEvent, IncomingEvent, LeaderState, SessionState};
use crate::origin::OriginId;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct HubInner {
    origin: OriginId,
    channel: CrossTabChannel,
    batcher: Mutex<MessageBatcher>,
    election: Mutex<LeaderElection>,
    clock: SharedClock,
    heartbeat_interval: Duration,
    leader_timeout: Duration,
    auto_claim: bool,
    bus: Arc<EventBus<IncomingEvent>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// Cross-process coordination service. Cheap to clone.
#[derive(Clone)]
pub struct CoordinationHub {
    inner: Arc<HubInner>,
}

impl CoordinationHub {
    pub fn new(
        origin: OriginId,
        slot: Arc<dyn SharedSlot>,
        config: &SyncConfig,
        clock: SharedClock,
    ) -> Self {
        let channel = CrossTabChannel::new(origin, slot, config.channel.clone(), clock.clone());
        Self {
            inner: Arc::new(HubInner {
                origin,
                channel,
                batcher: Mutex::new(MessageBatcher::new(config.batch.clone())),
                election: Mutex::new(LeaderElection::new(origin, config.leader.clone())),
                clock,
                heartbeat_interval: config.leader.heartbeat_interval(),
                leader_timeout: Duration::from_millis(config.leader.leader_timeout_ms),
                auto_claim: config.leader.auto_claim,
                bus: Arc::new(EventBus::new()),
                dispatcher: Mutex::new(None),
                heartbeat: Mutex::new(None),
                watchdog: Mutex::new(None),
            }),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.inner.origin
    }

    /// Start observing the channel (and the stale-leader watchdog when
    /// `auto_claim` is set). Idempotent.
    pub fn init(&self) {
        let mut dispatcher = lock(&self.inner.dispatcher);
        if dispatcher.is_some() {
            return;
        }
        self.inner.channel.start();
        let incoming = self.inner.channel.subscribe();
        *dispatcher = Some(tokio::spawn(dispatch(Arc::downgrade(&self.inner), incoming)));

        if self.inner.auto_claim {
            let weak = Arc::downgrade(&self.inner);
            *lock(&self.inner.watchdog) = Some(tokio::spawn(watchdog(weak)));
        }
        info!("Coordination hub {} started", self.inner.origin);
    }

    /// Release leadership, flush pending events and stop all tasks.
    pub async fn shutdown(&self) {
        if let Err(e) = self.release_leadership().await {
            warn!("Failed to release leadership on shutdown: {}", e);
        }
        flush(&self.inner).await;
        for slot in [&self.inner.dispatcher, &self.inner.heartbeat, &self.inner.watchdog] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
        self.inner.channel.shutdown();
        info!("Coordination hub {} stopped", self.inner.origin);
    }

    /// Queue `event` for the other processes (batched and deduplicated).
    pub async fn broadcast(&self, event: ChannelEvent) -> Result<()> {
        if event.kind().is_session() {
            return Err(SyncError::Permanent(format!(
                "{} is reserved for leader election",
                event.kind()
            )));
        }
        let now = self.inner.clock.now_ms();
        let opened = lock(&self.inner.batcher).offer(event, now);
        if opened {
            let weak = Arc::downgrade(&self.inner);
            let window = lock(&self.inner.batcher).config().window();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(inner) = weak.upgrade() {
                    flush(&inner).await;
                }
            });
        }
        Ok(())
    }

    /// Send whatever the batcher holds right now.
    pub async fn flush(&self) {
        flush(&self.inner).await;
    }

    /// Events from other processes.
    pub fn subscribe(&self) -> Subscription<IncomingEvent> {
        self.inner.bus.subscribe()
    }

    /// Try to become session owner. Returns whether this process now leads.
    pub async fn claim_leadership(&self) -> Result<bool> {
        claim(&self.inner).await
    }

    pub fn is_leader(&self) -> bool {
        lock(&self.inner.election).is_leader()
    }

    pub fn leader(&self) -> Option<LeaderState> {
        lock(&self.inner.election).leader().cloned()
    }

    /// The session state: ours while leading, the leader's mirror otherwise.
    pub fn session_state(&self) -> SessionState {
        lock(&self.inner.election).session_state().clone()
    }

    /// Publish a new session state. Fails with `NotLeader` on followers.
    pub async fn broadcast_session_state(&self, state: SessionState) -> Result<()> {
        let now = self.inner.clock.now_ms();
        let announcement = lock(&self.inner.election).set_session_state(state, now)?;
        self.inner
            .channel
            .send(ChannelEvent::SessionHeartbeat(announcement))
            .await?;
        Ok(())
    }

    /// Step down gracefully. A no-op for followers.
    pub async fn release_leadership(&self) -> Result<()> {
        let released = lock(&self.inner.election).release();
        if let Some(handle) = lock(&self.inner.heartbeat).take() {
            handle.abort();
        }
        if let Some(leader_id) = released {
            self.inner
                .channel
                .send(ChannelEvent::SessionReleased { leader_id })
                .await?;
        }
        Ok(())
    }

    pub fn batch_stats(&self) -> BatchStats {
        lock(&self.inner.batcher).stats()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn flush(inner: &HubInner) {
    let now = inner.clock.now_ms();
    let events = lock(&inner.batcher).take_flush(now);
    for event in events {
        if let Err(e) = inner.channel.send(event).await {
            warn!("Failed to send batched event: {}", e);
        }
    }
}

async fn claim(inner: &Arc<HubInner>) -> Result<bool> {
    let now = inner.clock.now_ms();
    let claimed = lock(&inner.election).claim(now);
    let Some(state) = claimed else {
        return Ok(false);
    };
    inner.channel.send(ChannelEvent::SessionClaim(state)).await?;

    let mut heartbeat = lock(&inner.heartbeat);
    let running = heartbeat.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
    if !running {
        let weak = Arc::downgrade(inner);
        *heartbeat = Some(tokio::spawn(heartbeat_loop(weak, inner.heartbeat_interval)));
    }
    Ok(true)
}

/// Re-announce every `interval` until we stop leading.
async fn heartbeat_loop(inner: Weak<HubInner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else { return };
        let now = inner.clock.now_ms();
        let Some(state) = lock(&inner.election).heartbeat(now) else {
            debug!("{} no longer leads, heartbeat stopped", inner.origin);
            return;
        };
        if let Err(e) = inner.channel.send(ChannelEvent::SessionHeartbeat(state)).await {
            warn!("Failed to send heartbeat: {}", e);
        }
    }
}

/// Claim automatically once the known leader goes stale.
async fn watchdog(inner: Weak<HubInner>) {
    loop {
        let period = match inner.upgrade() {
            Some(inner) => inner.leader_timeout / 2,
            None => return,
        };
        tokio::time::sleep(period).await;
        let Some(inner) = inner.upgrade() else { return };
        let now = inner.clock.now_ms();
        let stale = lock(&inner.election).check_staleness(now);
        if stale {
            match claim(&inner).await {
                Ok(true) => info!("{} took over the stale session", inner.origin),
                Ok(false) => {}
                Err(e) => warn!("Failed to claim stale session: {}", e),
            }
        }
    }
}

async fn dispatch(
    inner: Weak<HubInner>,
    mut incoming: Subscription<crate::message::CrossTabMessage>,
) {
    while let Some(msg) = incoming.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        if msg.kind.is_session() {
            let transition = lock(&inner.election).on_message(&msg.payload);
            match transition {
                Some(Transition::Demoted { by }) => {
                    info!("{} yields session to {}", inner.origin, by);
                    if let Some(handle) = lock(&inner.heartbeat).take() {
                        handle.abort();
                    }
                }
                Some(other) => debug!("Session: {:?}", other),
                None => {}
            }
        }
        inner.bus.emit(IncomingEvent::from(msg));
    }
}

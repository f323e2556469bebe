//! Cross-process channel over a single shared, observable slot.
//!
//! A sender writes one serialized [`CrossTabMessage`] to the slot and clears
//! it shortly afterwards; the slot itself has no queue. Receivers:
//!
//! 1. drop messages carrying their own origin id
//! 2. buffer the rest in an [`Intake`]
//! 3. after a short debounce, apply the buffer sorted by timestamp, skipping
//!    ids already processed and anything older than the last applied message
//!
//! Malformed slot values are logged and discarded; the channel fails open.

use crate::clock::SharedClock;
use crate::config::ChannelConfig;
use crate::error::ErrorCategory;
use crate::events::{EventBus, Subscription};
use crate::message::{ChannelEvent, CrossTabMessage, MessageError};
use crate::origin::OriginId;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Capacity of the slot's observation feed.
const SLOT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("Shared slot error: {0}")]
    Slot(String),

    #[error(transparent)]
    Message(#[from] MessageError),
}

impl ChannelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChannelError::Slot(_) => ErrorCategory::Transient,
            ChannelError::Message(_) => ErrorCategory::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// One shared, observable key visible to every process of the same client.
#[async_trait]
pub trait SharedSlot: Send + Sync {
    /// Publish a value; every watcher (this process included) observes it.
    async fn write(&self, value: String) -> Result<()>;

    /// Remove this participant's last written value.
    async fn clear(&self) -> Result<()>;

    /// Feed of observed values.
    fn watch(&self) -> broadcast::Receiver<String>;
}

/// Slot shared between in-process "tabs" (tests, single-binary setups).
pub struct InMemorySlot {
    value: RwLock<Option<String>>,
    tx: broadcast::Sender<String>,
}

impl InMemorySlot {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SLOT_FEED_CAPACITY);
        Self {
            value: RwLock::new(None),
            tx,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn current(&self) -> Option<String> {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for InMemorySlot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedSlot for InMemorySlot {
    async fn write(&self, value: String) -> Result<()> {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = Some(value.clone());
        // No watchers is fine
        let _ = self.tx.send(value);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Receive-side buffer. Pure: callers decide when to drain.
pub struct Intake {
    own_origin: OriginId,
    buffer: Vec<CrossTabMessage>,
    processed_order: VecDeque<String>,
    processed: HashSet<String>,
    capacity: usize,
    watermark: u64,
}

impl Intake {
    pub fn new(own_origin: OriginId, capacity: usize) -> Self {
        Self {
            own_origin,
            buffer: Vec::new(),
            processed_order: VecDeque::new(),
            processed: HashSet::new(),
            capacity: capacity.max(1),
            watermark: 0,
        }
    }

    /// Parse and buffer a raw slot value. Returns true if it was buffered.
    pub fn offer(&mut self, raw: &str) -> bool {
        if raw.is_empty() {
            return false;
        }
        match CrossTabMessage::from_json(raw) {
            Ok(msg) => self.push(msg),
            Err(e) => {
                warn!("Discarding malformed cross-process message: {}", e);
                false
            }
        }
    }

    /// Buffer a parsed message unless it is our own echo.
    pub fn push(&mut self, msg: CrossTabMessage) -> bool {
        if msg.origin_id == self.own_origin {
            return false;
        }
        self.buffer.push(msg);
        true
    }

    /// Everything buffered that should be applied, in timestamp order.
    pub fn drain(&mut self) -> Vec<CrossTabMessage> {
        let mut batch = std::mem::take(&mut self.buffer);
        batch.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut ready = Vec::with_capacity(batch.len());
        for msg in batch {
            if self.processed.contains(&msg.id) {
                continue;
            }
            if msg.timestamp < self.watermark {
                debug!("Skipping stale message {} ({} < {})", msg.id, msg.timestamp, self.watermark);
                continue;
            }
            self.watermark = msg.timestamp;
            self.remember(msg.id.clone());
            ready.push(msg);
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    fn remember(&mut self, id: String) {
        self.processed.insert(id.clone());
        self.processed_order.push_back(id);
        while self.processed_order.len() > self.capacity {
            if let Some(old) = self.processed_order.pop_front() {
                self.processed.remove(&old);
            }
        }
    }
}

/// Per-process endpoint of the cross-process channel.
pub struct CrossTabChannel {
    origin: OriginId,
    slot: Arc<dyn SharedSlot>,
    config: ChannelConfig,
    clock: SharedClock,
    bus: Arc<EventBus<CrossTabMessage>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl CrossTabChannel {
    pub fn new(
        origin: OriginId,
        slot: Arc<dyn SharedSlot>,
        config: ChannelConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            origin,
            slot,
            config,
            clock,
            bus: Arc::new(EventBus::new()),
            observer: Mutex::new(None),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Start observing the slot. Idempotent.
    pub fn start(&self) {
        let mut observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        if observer.is_some() {
            return;
        }
        let rx = self.slot.watch();
        let intake = Intake::new(self.origin, self.config.processed_id_capacity);
        let bus = Arc::clone(&self.bus);
        let debounce = self.config.intake_debounce();
        *observer = Some(tokio::spawn(observe(rx, intake, bus, debounce)));
    }

    /// Stop observing. Subscriptions stay valid but receive nothing more.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Messages from other processes, in the order they are applied.
    pub fn subscribe(&self) -> Subscription<CrossTabMessage> {
        self.bus.subscribe()
    }

    /// Wrap `payload` in a message from this process and send it.
    pub async fn send(&self, payload: ChannelEvent) -> Result<CrossTabMessage> {
        let msg = CrossTabMessage::new(self.origin, self.clock.now_ms(), payload);
        self.send_message(&msg).await?;
        Ok(msg)
    }

    /// Write `msg` to the slot and clear it after `clear_delay`.
    pub async fn send_message(&self, msg: &CrossTabMessage) -> Result<()> {
        let raw = msg.to_json()?;
        self.slot.write(raw).await?;
        debug!("Sent {} {}", msg.kind, msg.id);

        let slot = Arc::clone(&self.slot);
        let delay = self.config.clear_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = slot.clear().await {
                debug!("Failed to clear shared slot: {}", e);
            }
        });
        Ok(())
    }
}

impl Drop for CrossTabChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn observe(
    mut rx: broadcast::Receiver<String>,
    mut intake: Intake,
    bus: Arc<EventBus<CrossTabMessage>>,
    debounce: std::time::Duration,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(raw) => {
                    if intake.offer(&raw) {
                        deadline = Some(Instant::now() + debounce);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Cross-process observer lagged, {} message(s) lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                for msg in intake.drain() {
                    bus.emit(msg);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn msg(origin: u64, ts: u64, id: &str) -> CrossTabMessage {
        let mut m = CrossTabMessage::new(
            OriginId::from(origin),
            ts,
            ChannelEvent::DocumentDeleted { id: id.into() },
        );
        m.id = format!("m-{}-{}", id, ts);
        m
    }

    // ==================== Intake ====================

    #[test]
    fn test_intake_drops_own_origin() {
        let mut intake = Intake::new(OriginId::from(1), 10);
        assert!(!intake.push(msg(1, 10, "a")));
        assert!(intake.push(msg(2, 10, "a")));
        assert_eq!(intake.pending(), 1);
    }

    #[test]
    fn test_intake_sorts_by_timestamp() {
        let mut intake = Intake::new(OriginId::from(1), 10);
        intake.push(msg(2, 30, "c"));
        intake.push(msg(3, 10, "a"));
        intake.push(msg(2, 20, "b"));

        let order: Vec<_> = intake.drain().into_iter().map(|m| m.timestamp).collect();
        assert_eq!(order, vec![10, 20, 30]);
        assert_eq!(intake.watermark(), 30);
    }

    #[test]
    fn test_intake_skips_processed_and_stale() {
        let mut intake = Intake::new(OriginId::from(1), 10);
        let first = msg(2, 100, "a");
        intake.push(first.clone());
        assert_eq!(intake.drain().len(), 1);

        // Redelivery and an older message
        intake.push(first);
        intake.push(msg(3, 50, "b"));
        assert!(intake.drain().is_empty());

        intake.push(msg(3, 100, "c"));
        assert_eq!(intake.drain().len(), 1);
    }

    #[test]
    fn test_intake_processed_memory_is_bounded() {
        let mut intake = Intake::new(OriginId::from(1), 2);
        for (i, ts) in [1u64, 2, 3].iter().enumerate() {
            intake.push(msg(2, *ts, &format!("d{}", i)));
        }
        intake.drain();
        assert_eq!(intake.processed.len(), 2);
        assert!(!intake.processed.contains("m-d0-1"));
    }

    #[test]
    fn test_intake_discards_malformed() {
        let mut intake = Intake::new(OriginId::from(1), 10);
        assert!(!intake.offer("{\"garbage\":true}"));
        assert!(!intake.offer(""));
        let raw = msg(2, 5, "a").to_json().unwrap();
        assert!(intake.offer(&raw));
    }

    // ==================== Channel ====================

    fn channel(origin: u64, slot: &Arc<InMemorySlot>) -> CrossTabChannel {
        CrossTabChannel::new(
            OriginId::from(origin),
            slot.clone(),
            ChannelConfig::default(),
            ManualClock::shared(1_000),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_process_receives_and_sender_does_not() {
        let slot = InMemorySlot::shared();
        let a = channel(1, &slot);
        let b = channel(2, &slot);
        a.start();
        b.start();
        let mut from_a = a.subscribe();
        let mut from_b = b.subscribe();
        tokio::task::yield_now().await;

        a.send(ChannelEvent::DocumentDeleted { id: "t1".into() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let received = from_b.try_recv().unwrap();
        assert_eq!(received.origin_id, OriginId::from(1));
        assert!(from_a.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_is_cleared_after_delay() {
        let slot = InMemorySlot::shared();
        let a = channel(1, &slot);
        a.send(ChannelEvent::SyncStatus { status: "idle".into() })
            .await
            .unwrap();
        assert!(slot.current().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(slot.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_slot_value_does_not_stop_observer() {
        let slot = InMemorySlot::shared();
        let a = channel(1, &slot);
        let b = channel(2, &slot);
        b.start();
        let mut sub = b.subscribe();
        tokio::task::yield_now().await;

        slot.write("}{".into()).await.unwrap();
        a.send(ChannelEvent::DocumentDeleted { id: "t1".into() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(sub.try_recv().is_some());
    }
}

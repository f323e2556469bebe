//! Event infrastructure for replica-core.
//!
//! `EventBus<T>` fans typed events out to subscribers. Each subscriber gets a
//! bounded channel; a subscriber that falls behind by more than
//! `SUBSCRIBER_CAPACITY` events loses the overflow (logged) rather than
//! stalling the publisher. Dropping the [`Subscription`] unsubscribes.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::warn;

/// Buffered events per subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 256;

/// Events emitted by the orchestrator for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A replication cycle finished.
    #[serde(rename_all = "camelCase")]
    CycleCompleted {
        pushed: usize,
        pulled: usize,
        conflicts: usize,
        duration_ms: u64,
    },
    /// A replication cycle failed.
    #[serde(rename_all = "camelCase")]
    CycleFailed {
        error: String,
        critical: bool,
        /// Operator-facing text for critical failures.
        operator_message: Option<String>,
    },
    /// A conflict was resolved, automatically or by `manual_resolve`.
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        conflict_id: String,
        strategy: String,
    },
    /// A queued operation was dropped after its last attempt.
    #[serde(rename_all = "camelCase")]
    OperationFailed { operation_id: String, error: String },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    bus: Weak<EventBus<T>>,
    id: usize,
}

impl<T> Subscription<T> {
    /// Next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing typed events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<T> {
    senders: RwLock<Vec<(usize, mpsc::Sender<T>)>>,
    next_id: AtomicUsize,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            senders: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<T> EventBus<T> {
    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock
        if let Ok(mut guard) = self.senders.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, tx));
        Subscription {
            rx,
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: T) {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        for (id, tx) in senders.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                warn!("Subscriber {} is lagging, dropping event", id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

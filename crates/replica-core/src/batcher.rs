//! Outgoing message batching and deduplication.
//!
//! Two stages:
//! 1. Coalescing: events are held for `window` keyed by their dedup key
//!    (`kind:entity`); a later event with the same key replaces the earlier
//!    one.
//! 2. Send cache: after a flush, `key -> sent_at` is kept for `dedup_ttl`.
//!    A flushed event whose key is still fresh is suppressed, whatever its
//!    content.
//!
//! Pure state; the hub owns the timer that calls [`MessageBatcher::take_flush`].

use crate::config::BatchConfig;
use crate::message::ChannelEvent;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub offered: u64,
    pub coalesced: u64,
    pub flushed: u64,
    pub suppressed: u64,
}

pub struct MessageBatcher {
    config: BatchConfig,
    /// Insertion-ordered pending events.
    pending: Vec<(String, ChannelEvent)>,
    window_opened_at: Option<u64>,
    /// Dedup key -> last sent time.
    sent: HashMap<String, u64>,
    stats: BatchStats,
}

impl MessageBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            window_opened_at: None,
            sent: HashMap::new(),
            stats: BatchStats::default(),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Hold `event` for the current window.
    ///
    /// Returns true when this call opened a new window, i.e. the caller
    /// should schedule a flush `window` from now.
    pub fn offer(&mut self, event: ChannelEvent, now_ms: u64) -> bool {
        self.stats.offered += 1;
        let key = event.dedup_key();

        if let Some(slot) = self.pending.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = event;
            self.stats.coalesced += 1;
        } else {
            self.pending.push((key, event));
        }

        if self.window_opened_at.is_none() {
            self.window_opened_at = Some(now_ms);
            return true;
        }
        false
    }

    /// Whether the open window has expired.
    pub fn flush_due(&self, now_ms: u64) -> bool {
        self.window_opened_at
            .map(|opened| now_ms >= opened + self.config.window_ms)
            .unwrap_or(false)
    }

    /// Close the window and return the events that should actually be sent.
    pub fn take_flush(&mut self, now_ms: u64) -> Vec<ChannelEvent> {
        self.window_opened_at = None;
        self.prune(now_ms);

        let mut out = Vec::with_capacity(self.pending.len());
        for (key, event) in self.pending.drain(..) {
            if self.sent.contains_key(&key) {
                debug!("Suppressing duplicate {}", key);
                self.stats.suppressed += 1;
                continue;
            }
            self.sent.insert(key, now_ms);
            self.stats.flushed += 1;
            out.push(event);
        }
        out
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    fn prune(&mut self, now_ms: u64) {
        let ttl = self.config.dedup_ttl_ms;
        self.sent.retain(|_, sent_at| now_ms.saturating_sub(*sent_at) < ttl);
    }
}

impl Default for MessageBatcher {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}

//! Sync counters, persisted as the single state record `metrics`.

use crate::state::{self, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// State record key.
pub const METRICS_KEY: &str = "metrics";

/// Cycles included in the rolling average.
const DURATION_WINDOW: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub last_sync_time: Option<u64>,
    recent_durations_ms: VecDeque<u64>,
}

impl SyncMetrics {
    pub async fn load(state: &dyn StateStore) -> state::Result<Self> {
        Ok(state::load_record(state, METRICS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn save(&self, state: &dyn StateStore) -> state::Result<()> {
        state::save_record(state, METRICS_KEY, self).await
    }

    pub fn record_success(&mut self, now_ms: u64, duration_ms: u64) {
        self.total_syncs += 1;
        self.successful_syncs += 1;
        self.last_sync_time = Some(now_ms);
        self.push_duration(duration_ms);
    }

    pub fn record_failure(&mut self, duration_ms: u64) {
        self.total_syncs += 1;
        self.failed_syncs += 1;
        self.push_duration(duration_ms);
    }

    pub fn record_conflicts(&mut self, detected: u64) {
        self.conflicts_detected += detected;
    }

    pub fn record_resolved(&mut self, resolved: u64) {
        self.conflicts_resolved += resolved;
    }

    /// Mean duration of the last 20 cycles, 0 before the first one.
    pub fn average_duration_ms(&self) -> u64 {
        if self.recent_durations_ms.is_empty() {
            return 0;
        }
        self.recent_durations_ms.iter().sum::<u64>() / self.recent_durations_ms.len() as u64
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn push_duration(&mut self, duration_ms: u64) {
        self.recent_durations_ms.push_back(duration_ms);
        while self.recent_durations_ms.len() > DURATION_WINDOW {
            self.recent_durations_ms.pop_front();
        }
    }
}

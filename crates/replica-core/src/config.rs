//! Configuration for every sync-core component.
//!
//! All durations are stored as milliseconds so the config file stays plain
//! JSON; each section exposes `Duration` accessors. Missing sections and
//! fields fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub orchestrator: OrchestratorConfig,
    pub health: HealthConfig,
    pub channel: ChannelConfig,
    pub batch: BatchConfig,
    pub leader: LeaderConfig,
    pub conflict: ConflictConfig,
    pub queue: QueueConfig,
}

/// Retry engine: exponential backoff with optional jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts including the first (default: 3)
    pub max_attempts: u32,
    /// Delay before the second attempt (default: 1s)
    pub base_delay_ms: u64,
    /// Multiplier per attempt (default: 2.0)
    pub backoff_factor: f64,
    /// Upper bound for any single delay (default: 30s)
    pub max_delay_ms: u64,
    /// Randomize each delay by ±25% (default: true)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Circuit breaker guarding replication cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit (default: 5)
    pub max_consecutive_errors: u32,
    /// A single cycle longer than this opens the circuit (default: 60s)
    pub max_sync_duration_ms: u64,
    /// How long the circuit stays open before allowing a probe (default: 30s)
    pub open_cooldown_ms: u64,
    /// Minimum gap between any two sync attempts, open or not (default: 2s)
    pub min_attempt_interval_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            max_sync_duration_ms: 60_000,
            open_cooldown_ms: 30_000,
            min_attempt_interval_ms: 2_000,
        }
    }
}

/// Sync orchestrator state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Minimum gap between user-initiated syncs (default: 5s)
    pub manual_cooldown_ms: u64,
    /// Backups younger than this are mentioned in critical-error messages (default: 30 min)
    pub backup_max_age_ms: u64,
    /// Run the pre/post integrity check around each cycle (default: true)
    pub validate: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            manual_cooldown_ms: 5_000,
            backup_max_age_ms: 30 * 60 * 1_000,
            validate: true,
        }
    }
}

/// Remote health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthConfig {
    /// Probe period (default: 30s)
    pub interval_ms: u64,
    /// Failed probes in a row before forcing offline (default: 3)
    pub max_consecutive_failures: u32,
    /// A probe slower than this counts as failed (default: 10s)
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_consecutive_failures: 3,
            probe_timeout_ms: 10_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Cross-process channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// How long a written message stays in the shared slot (default: 50ms)
    pub clear_delay_ms: u64,
    /// Intake debounce before a batch is applied (default: 50ms)
    pub intake_debounce_ms: u64,
    /// How many processed message ids are remembered (default: 1000)
    pub processed_id_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            clear_delay_ms: 50,
            intake_debounce_ms: 50,
            processed_id_capacity: 1_000,
        }
    }
}

impl ChannelConfig {
    pub fn clear_delay(&self) -> Duration {
        Duration::from_millis(self.clear_delay_ms)
    }

    pub fn intake_debounce(&self) -> Duration {
        Duration::from_millis(self.intake_debounce_ms)
    }
}

/// Outgoing message batching and deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    /// Coalescing window (default: 100ms)
    pub window_ms: u64,
    /// Same logical change is not re-sent within this TTL (default: 5s)
    pub dedup_ttl_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: 100,
            dedup_ttl_ms: 5_000,
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Session-owner leader election.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeaderConfig {
    /// Leader is stale after this long without a heartbeat (default: 5s)
    pub leader_timeout_ms: u64,
    /// Heartbeat period while leading (default: 2s)
    pub heartbeat_interval_ms: u64,
    /// Claim automatically when the current leader goes stale (default: false)
    pub auto_claim: bool,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            leader_timeout_ms: 5_000,
            heartbeat_interval_ms: 2_000,
            auto_claim: false,
        }
    }
}

impl LeaderConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Conflict classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConflictConfig {
    /// Fields that only ever grow; concurrent edits merge by taking the max.
    pub counter_fields: Vec<String>,
}

/// Offline queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Attempts per operation before it is dropped (default: 3)
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
        }
    }
}

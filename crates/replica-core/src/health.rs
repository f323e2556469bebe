//! Remote health monitoring.
//!
//! [`HealthTracker`] counts consecutive probe failures and decides when the
//! remote should be treated as offline regardless of what the network signal
//! says. [`HealthMonitor`] drives it from a tokio task that probes a
//! [`HealthSubject`] every `interval`.

use crate::clock::SharedClock;
use crate::config::HealthConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a probe result changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Unchanged,
    /// The failure threshold was just reached.
    WentOffline,
    /// First success after being forced offline.
    Recovered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub consecutive_failures: u32,
    pub forced_offline: bool,
    pub last_probe_at: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    max_failures: u32,
    snapshot: HealthSnapshot,
}

impl HealthTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            max_failures: config.max_consecutive_failures.max(1),
            snapshot: HealthSnapshot::default(),
        }
    }

    pub fn record_success(&mut self, now_ms: u64) -> HealthVerdict {
        let was_offline = self.snapshot.forced_offline;
        self.snapshot = HealthSnapshot {
            last_probe_at: Some(now_ms),
            ..HealthSnapshot::default()
        };
        if was_offline {
            HealthVerdict::Recovered
        } else {
            HealthVerdict::Unchanged
        }
    }

    pub fn record_failure(&mut self, now_ms: u64, error: &str) -> HealthVerdict {
        let s = &mut self.snapshot;
        s.consecutive_failures += 1;
        s.last_probe_at = Some(now_ms);
        s.last_error = Some(error.to_string());

        if !s.forced_offline && s.consecutive_failures >= self.max_failures {
            s.forced_offline = true;
            return HealthVerdict::WentOffline;
        }
        HealthVerdict::Unchanged
    }

    pub fn is_forced_offline(&self) -> bool {
        self.snapshot.forced_offline
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.snapshot.consecutive_failures
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.clone()
    }

    pub fn reset(&mut self) {
        self.snapshot = HealthSnapshot::default();
    }
}

/// The thing being monitored.
#[async_trait]
pub trait HealthSubject: Send + Sync {
    /// Whether a probe should run right now (e.g. not while paused).
    fn wants_probe(&self) -> bool;

    /// One reachability check.
    async fn probe(&self) -> Result<()>;

    /// React to a verdict that changed something.
    fn on_verdict(&self, verdict: HealthVerdict);
}

/// Periodic prober. The tracker outlives start/stop cycles until `reset`.
pub struct HealthMonitor {
    config: HealthConfig,
    clock: SharedClock,
    tracker: Arc<Mutex<HealthTracker>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, clock: SharedClock) -> Self {
        let tracker = HealthTracker::new(&config);
        Self {
            config,
            clock,
            tracker: Arc::new(Mutex::new(tracker)),
            task: Mutex::new(None),
        }
    }

    /// Start probing `subject`. Idempotent.
    pub fn start(&self, subject: Weak<dyn HealthSubject>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let tracker = Arc::clone(&self.tracker);
        let clock = self.clock.clone();
        let config = self.config.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(subject) = subject.upgrade() else { return };
                if !subject.wants_probe() {
                    continue;
                }
                let verdict = probe_once(subject.as_ref(), &tracker, &clock, &config).await;
                if verdict != HealthVerdict::Unchanged {
                    subject.on_verdict(verdict);
                }
            }
        }));
        debug!("Health monitor started ({}ms)", self.config.interval_ms);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
            debug!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Probe immediately, outside the schedule.
    pub async fn check_now(&self, subject: &dyn HealthSubject) -> HealthVerdict {
        let verdict = probe_once(subject, &self.tracker, &self.clock, &self.config).await;
        if verdict != HealthVerdict::Unchanged {
            subject.on_verdict(verdict);
        }
        verdict
    }

    pub fn is_forced_offline(&self) -> bool {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).is_forced_offline()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).snapshot()
    }

    pub fn reset(&self) {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe_once(
    subject: &dyn HealthSubject,
    tracker: &Mutex<HealthTracker>,
    clock: &SharedClock,
    config: &HealthConfig,
) -> HealthVerdict {
    let result = match tokio::time::timeout(config.probe_timeout(), subject.probe()).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Transient(format!(
            "probe timed out after {}ms",
            config.probe_timeout_ms
        ))),
    };

    let now = clock.now_ms();
    let mut tracker = tracker.lock().unwrap_or_else(|e| e.into_inner());
    match result {
        Ok(()) => {
            let verdict = tracker.record_success(now);
            if verdict == HealthVerdict::Recovered {
                info!("Remote reachable again");
            }
            verdict
        }
        Err(e) => {
            let verdict = tracker.record_failure(now, &e.to_string());
            warn!(
                "Health probe failed ({} in a row): {}",
                tracker.consecutive_failures(),
                e
            );
            verdict
        }
    }
}

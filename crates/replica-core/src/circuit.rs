//! Circuit breaker for replication cycles.
//!
//! Tracks consecutive sync failures and cycle duration:
//! 1. `Closed`: syncs allowed; failures are counted
//! 2. `Open`: entered after `max_consecutive_errors` failures in a row, or one
//!    cycle slower than `max_sync_duration`; every attempt is refused
//! 3. `HalfOpen`: after `open_cooldown` one probe cycle is let through;
//!    success closes the circuit, failure re-opens it
//!
//! Independently of state, attempts closer together than
//! `min_attempt_interval` are refused. That gap is what breaks the
//! push → remote change → pull → local change → push ping-pong.
//!
//! Like the other state machines in this crate it never reads the clock:
//! callers pass `now_ms`.

use crate::config::CircuitConfig;
use crate::error::{Result, SyncError};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Transitions kept for the metrics snapshot.
const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_ms: u64,
    pub reason: String,
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub total_successes: u64,
    pub times_opened: u64,
    pub last_error: Option<String>,
    pub opened_at: Option<u64>,
    pub history: Vec<CircuitTransition>,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    consecutive_errors: u32,
    total_errors: u64,
    total_successes: u64,
    times_opened: u64,
    opened_at: Option<u64>,
    last_attempt_at: Option<u64>,
    last_error: Option<String>,
    history: VecDeque<CircuitTransition>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_errors: 0,
            total_errors: 0,
            total_successes: 0,
            times_opened: 0,
            opened_at: None,
            last_attempt_at: None,
            last_error: None,
            history: VecDeque::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitConfig::default())
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Closed with no outstanding failures.
    pub fn is_healthy(&self) -> bool {
        self.state == CircuitState::Closed && self.consecutive_errors == 0
    }

    /// True when the circuit admits traffic (closed, or open with cooldown elapsed).
    ///
    /// Ignores the attempt interval; see [`check`](Self::check) for the full gate.
    pub fn is_admitting(&self, now_ms: u64) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.cooldown_elapsed(now_ms),
        }
    }

    /// Whether a sync attempt may start at `now_ms`.
    pub fn can_sync(&self, now_ms: u64) -> bool {
        self.check(now_ms).is_ok()
    }

    /// Full gate: circuit state plus the minimum attempt interval.
    pub fn check(&self, now_ms: u64) -> Result<()> {
        if !self.is_admitting(now_ms) {
            return Err(SyncError::CircuitOpen);
        }
        if let Some(remaining_ms) = self.interval_remaining(now_ms) {
            return Err(SyncError::Throttled { remaining_ms });
        }
        Ok(())
    }

    /// Milliseconds until the next attempt is allowed, if currently refused.
    pub fn retry_after_ms(&self, now_ms: u64) -> Option<u64> {
        let open_remaining = match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some((opened + self.config.open_cooldown_ms).saturating_sub(now_ms))
            }
            _ => None,
        }
        .filter(|ms| *ms > 0);
        match (open_remaining, self.interval_remaining(now_ms)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Register the start of an attempt. Moves an open circuit whose
    /// cooldown has elapsed to half-open (this attempt is the probe).
    pub fn begin_attempt(&mut self, now_ms: u64) -> Result<()> {
        self.check(now_ms)?;
        if self.state == CircuitState::Open {
            self.transition(CircuitState::HalfOpen, now_ms, "cooldown elapsed, probing");
        }
        self.last_attempt_at = Some(now_ms);
        Ok(())
    }

    /// Record a completed cycle. A cycle slower than `max_sync_duration`
    /// opens the circuit even though it succeeded.
    pub fn record_success(&mut self, now_ms: u64, duration_ms: u64) {
        self.total_successes += 1;
        self.consecutive_errors = 0;

        if duration_ms > self.config.max_sync_duration_ms {
            warn!(
                "Sync took {}ms (limit {}ms), opening circuit",
                duration_ms, self.config.max_sync_duration_ms
            );
            self.last_error = Some(format!("sync took {}ms", duration_ms));
            self.open(now_ms, "sync exceeded max duration");
            return;
        }

        if self.state != CircuitState::Closed {
            self.transition(CircuitState::Closed, now_ms, "probe succeeded");
            self.opened_at = None;
        }
    }

    /// Record a failed cycle.
    pub fn record_failure(&mut self, now_ms: u64, error: &str) {
        self.total_errors += 1;
        self.consecutive_errors += 1;
        self.last_error = Some(error.to_string());

        match self.state {
            CircuitState::HalfOpen => self.open(now_ms, "probe failed"),
            CircuitState::Closed
                if self.consecutive_errors >= self.config.max_consecutive_errors =>
            {
                self.open(now_ms, "too many consecutive errors")
            }
            _ => {}
        }
    }

    /// Back to a fresh closed circuit. History and totals are kept.
    pub fn reset(&mut self) {
        if self.state != CircuitState::Closed {
            let at = self.opened_at.unwrap_or(0);
            self.transition(CircuitState::Closed, at, "manual reset");
        }
        self.consecutive_errors = 0;
        self.opened_at = None;
        self.last_attempt_at = None;
        self.last_error = None;
    }

    pub fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            state: self.state,
            consecutive_errors: self.consecutive_errors,
            total_errors: self.total_errors,
            total_successes: self.total_successes,
            times_opened: self.times_opened,
            last_error: self.last_error.clone(),
            opened_at: self.opened_at,
            history: self.history.iter().cloned().collect(),
        }
    }

    fn open(&mut self, now_ms: u64, reason: &str) {
        self.times_opened += 1;
        self.opened_at = Some(now_ms);
        self.transition(CircuitState::Open, now_ms, reason);
    }

    fn cooldown_elapsed(&self, now_ms: u64) -> bool {
        self.opened_at
            .map(|opened| now_ms >= opened + self.config.open_cooldown_ms)
            .unwrap_or(true)
    }

    fn interval_remaining(&self, now_ms: u64) -> Option<u64> {
        let last = self.last_attempt_at?;
        let ready_at = last + self.config.min_attempt_interval_ms;
        (now_ms < ready_at).then(|| ready_at - now_ms)
    }

    fn transition(&mut self, to: CircuitState, at_ms: u64, reason: &str) {
        if self.state == to {
            return;
        }
        info!("Circuit {:?} -> {:?}: {}", self.state, to, reason);
        self.history.push_back(CircuitTransition {
            from: self.state,
            to,
            at_ms,
            reason: reason.to_string(),
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        self.state = to;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            max_consecutive_errors: 3,
            max_sync_duration_ms: 10_000,
            open_cooldown_ms: 30_000,
            min_attempt_interval_ms: 1_000,
        }
    }

    fn fail(cb: &mut CircuitBreaker, now: u64) {
        cb.begin_attempt(now).unwrap();
        cb.record_failure(now, "timeout");
    }

    #[test]
    fn test_opens_after_consecutive_errors() {
        let mut cb = CircuitBreaker::new(config());

        fail(&mut cb, 0);
        fail(&mut cb, 2_000);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&mut cb, 4_000);

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_sync(6_000));
        assert!(matches!(cb.check(6_000), Err(SyncError::CircuitOpen)));
        assert!(!cb.is_healthy());
    }

    #[test]
    fn test_recovers_after_cooldown_and_successful_probe() {
        let mut cb = CircuitBreaker::new(config());
        for i in 0..3 {
            fail(&mut cb, i * 2_000);
        }
        let opened_at = 4_000;
        assert!(!cb.can_sync(opened_at + 29_999));

        // Cooldown elapsed: one probe admitted
        let probe_at = opened_at + 30_000;
        assert!(cb.can_sync(probe_at));
        cb.begin_attempt(probe_at).unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(probe_at + 100, 100);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_sync(probe_at + 1_000));
        assert!(cb.is_healthy());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut cb = CircuitBreaker::new(config());
        for i in 0..3 {
            fail(&mut cb, i * 2_000);
        }
        cb.begin_attempt(40_000).unwrap();
        cb.record_failure(40_000, "still down");

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_sync(41_000));
        assert_eq!(cb.metrics().times_opened, 2);
    }

    #[test]
    fn test_slow_sync_opens_circuit() {
        let mut cb = CircuitBreaker::new(config());
        cb.begin_attempt(0).unwrap();
        cb.record_success(20_000, 20_000);

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_min_interval_applies_while_closed() {
        let mut cb = CircuitBreaker::new(config());
        cb.begin_attempt(0).unwrap();
        cb.record_success(50, 50);

        assert!(matches!(
            cb.check(500),
            Err(SyncError::Throttled { remaining_ms: 500 })
        ));
        assert_eq!(cb.retry_after_ms(500), Some(500));
        assert!(cb.can_sync(1_000));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = CircuitBreaker::new(config());
        fail(&mut cb, 0);
        fail(&mut cb, 2_000);
        cb.begin_attempt(4_000).unwrap();
        cb.record_success(4_100, 100);
        fail(&mut cb, 6_000);
        fail(&mut cb, 8_000);

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_errors, 2);
        assert_eq!(cb.metrics().total_errors, 4);
    }

    #[test]
    fn test_reset_closes_and_records_history() {
        let mut cb = CircuitBreaker::new(config());
        for i in 0..3 {
            fail(&mut cb, i * 2_000);
        }
        cb.reset();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_sync(4_001));
        let history = cb.metrics().history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to, CircuitState::Open);
        assert_eq!(history[1].reason, "manual reset");
    }
}

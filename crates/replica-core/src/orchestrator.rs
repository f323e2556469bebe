//! SyncOrchestrator: the replication state machine.
//!
//! One cycle runs as:
//!
//! 1. `Validating`: the local store answers `info()`
//! 2. `Syncing`: push local changes, then pull remote ones, both through the
//!    retry engine; the ledger is saved after each leg
//! 3. `ResolvingConflicts`: every diverged document goes through the
//!    detector; mergeable ones are merged locally and pushed again, the rest
//!    wait for [`SyncOrchestrator::manual_resolve`]
//! 4. `Validating` again, then `Complete` and back to `Idle`
//!
//! Cycles never overlap. Manual triggers are throttled by a cooldown and
//! every attempt goes through the circuit breaker; a refused attempt is
//! parked in the offline queue as [`Operation::Sync`].

use crate::backup::{describe_age, BackupProvider};
use crate::circuit::{CircuitBreaker, CircuitMetrics};
use crate::clock::{system_clock, SharedClock};
use crate::config::SyncConfig;
use crate::conflict::{Conflict, ConflictDetector, ConflictResolver, ResolutionStrategy};
use crate::document::{DocId, Document, Revision};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::health::{HealthMonitor, HealthSnapshot, HealthSubject, HealthVerdict};
use crate::ledger::SyncLedger;
use crate::metrics::SyncMetrics;
use crate::queue::{DrainReport, OfflineQueue, Operation, OperationExecutor, Priority, QueueStats};
use crate::retry::RetryEngine;
use crate::state::StateStore;
use crate::store::{DocumentStore, StoreError};
use crate::transport::{RemoteTransport, ReplicationOptions, ReplicationReport, TransportError};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    ResolvingConflicts,
    Validating,
    Complete,
    Error,
    Offline,
    Paused,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::ResolvingConflicts => "resolving-conflicts",
            SyncStatus::Validating => "validating",
            SyncStatus::Complete => "complete",
            SyncStatus::Error => "error",
            SyncStatus::Offline => "offline",
            SyncStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub pushed: usize,
    pub pulled: usize,
    /// Conflicts seen for the first time in this cycle.
    pub conflicts_detected: usize,
    pub auto_resolved: usize,
    /// Conflicts waiting for manual resolution after this cycle.
    pub pending_conflicts: usize,
    pub duration_ms: u64,
}

/// What `submit` did with an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Applied locally and delivered to the remote.
    Delivered,
    /// Applied locally; delivery waits in the offline queue.
    Queued { operation_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub status: SyncStatus,
    pub conflict_count: usize,
    pub has_errors: bool,
    pub last_error: Option<String>,
    pub queue_stats: QueueStats,
    pub is_online: bool,
    pub uptime_ms: u64,
    pub last_sync_time: Option<u64>,
    pub circuit: CircuitMetrics,
    pub probe: HealthSnapshot,
}

/// In-memory state outside the core that must be rebuilt after a cycle
/// changed the local store (caches, indexes, views).
#[async_trait]
pub trait StateReloader: Send + Sync {
    fn name(&self) -> &str;

    async fn reload(&self) -> Result<()>;
}

#[derive(Debug)]
struct Runtime {
    initialized: bool,
    /// Network signal from the host.
    online: bool,
    paused: bool,
    last_manual_trigger: Option<u64>,
    last_error: Option<String>,
    started_at: Option<u64>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            initialized: false,
            online: true,
            paused: false,
            last_manual_trigger: None,
            last_error: None,
            started_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Leg {
    Push,
    Pull,
}

/// Record what both sides now agree on and move the checkpoint.
fn absorb(ledger: &mut SyncLedger, report: &ReplicationReport, leg: Leg) {
    for doc in report.written.iter().chain(&report.in_sync) {
        ledger.record(doc.clone());
    }
    match leg {
        Leg::Push => ledger.advance_push(report.checkpoint),
        Leg::Pull => ledger.advance_pull(report.checkpoint),
    }
}

fn is_cancellation(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Cancelled | SyncError::Transport(TransportError::Cancelled)
    )
}

/// Failures that only mean "not now": the work is kept for later.
fn worth_queueing(error: &SyncError) -> bool {
    error.defers_work() || error.is_retryable() || matches!(error, SyncError::RetriesExhausted { .. })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    local: Arc<dyn DocumentStore>,
    remote: Option<Arc<dyn RemoteTransport>>,
    state: Arc<dyn StateStore>,
    backup: Option<Arc<dyn BackupProvider>>,
    config: SyncConfig,
    clock: SharedClock,
    retry: RetryEngine,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    queue: OfflineQueue,
    circuit: Mutex<CircuitBreaker>,
    ledger: tokio::sync::Mutex<SyncLedger>,
    metrics: Mutex<SyncMetrics>,
    conflicts: Mutex<BTreeMap<String, Conflict>>,
    conflict_bus: Arc<EventBus<Conflict>>,
    events: Arc<EventBus<SyncEvent>>,
    reloaders: Vec<Arc<dyn StateReloader>>,
    status: watch::Sender<SyncStatus>,
    runtime: Mutex<Runtime>,
    /// Held for the whole of a cycle or a push.
    cycle: tokio::sync::Mutex<()>,
    health: HealthMonitor,
}

impl Inner {
    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: SyncStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("Sync status {} -> {}", previous, status);
        }
    }

    /// The transport, if a sync may run right now.
    fn ensure_ready(&self) -> Result<&Arc<dyn RemoteTransport>> {
        let rt = lock(&self.runtime);
        if !rt.initialized {
            return Err(SyncError::NotInitialized);
        }
        if rt.paused {
            return Err(SyncError::Paused);
        }
        let remote = self.remote.as_ref().ok_or(SyncError::Offline)?;
        if !rt.online || self.health.is_forced_offline() {
            return Err(SyncError::Offline);
        }
        Ok(remote)
    }

    async fn validate(&self, phase: &str) -> Result<()> {
        if !self.config.orchestrator.validate {
            return Ok(());
        }
        self.set_status(SyncStatus::Validating);
        let info = self.local.info().await?;
        debug!(
            "{} check: {} document(s) at seq {}",
            phase, info.document_count, info.update_seq
        );
        Ok(())
    }

    /// Park a sync in the queue unless one is already waiting.
    async fn defer_sync(&self) -> Result<String> {
        let pending = self.queue.pending().await?;
        if let Some(existing) = pending.iter().find(|op| op.operation == Operation::Sync) {
            return Ok(existing.id.clone());
        }
        let id = self.queue.enqueue(Operation::Sync, Priority::Low).await?;
        info!("Deferred sync queued as {}", id);
        Ok(id)
    }

    /// Keep `conflict` pending, in memory and as a state record.
    async fn hold_conflict(&self, conflict: &Conflict) -> Result<()> {
        conflict.save(self.state.as_ref()).await?;
        lock(&self.conflicts).insert(conflict.id.clone(), conflict.clone());
        Ok(())
    }

    async fn drop_conflict(&self, conflict: &Conflict) -> Result<()> {
        lock(&self.conflicts).remove(&conflict.id);
        Conflict::forget(self.state.as_ref(), &conflict.document_id).await?;
        Ok(())
    }

    async fn save_metrics(&self) {
        let metrics = lock(&self.metrics).clone();
        if let Err(e) = metrics.save(self.state.as_ref()).await {
            warn!("Failed to save sync metrics: {}", e);
        }
    }

    async fn reload_dependents(&self) {
        let results = join_all(self.reloaders.iter().map(|r| r.reload())).await;
        for (reloader, result) in self.reloaders.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to reload {} after sync: {}", reloader.name(), e);
            }
        }
    }

    /// Operator-facing text for a corruption-class failure.
    async fn critical_message(&self, error: &SyncError, now: u64) -> String {
        let backup = match &self.backup {
            Some(provider) => provider.latest_backup().await,
            None => None,
        };
        match backup {
            Some(b) if b.age_ms(now) < self.config.orchestrator.backup_max_age_ms => format!(
                "Sync stopped to protect your data ({}). A backup from {} ago is available at {}.",
                error,
                describe_age(b.age_ms(now)),
                b.location
            ),
            _ => format!(
                "Sync stopped to protect your data ({}). No recent backup was found; export your data before syncing again.",
                error
            ),
        }
    }

    /// Make the local store reflect `operation`. Safe to repeat.
    async fn apply_local(&self, operation: &Operation) -> Result<()> {
        let local = self.local.as_ref();
        match operation {
            Operation::Create(doc) => {
                let existing = match local.get(&doc.id).await {
                    Ok(existing) if !existing.deleted => {
                        debug!("{} already exists locally", doc.id);
                        return Ok(());
                    }
                    Ok(tombstone) => tombstone.rev,
                    Err(StoreError::NotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                };
                let mut doc = doc.clone();
                doc.rev = existing;
                doc.deleted = false;
                doc.updated_at = self.now();
                local.put(doc).await?;
            }
            Operation::Update { id, delta } => {
                let mut doc = match local.get(id).await {
                    Ok(doc) if !doc.deleted => doc,
                    Ok(_) | Err(StoreError::NotFound(_)) => {
                        return Err(SyncError::NotFound(id.clone()));
                    }
                    Err(e) => return Err(e.into()),
                };
                let before = doc.clone();
                doc.apply_delta(delta);
                if doc.same_content(&before) {
                    return Ok(());
                }
                doc.updated_at = self.now();
                local.put(doc).await?;
            }
            Operation::Delete { id } => match local.get(id).await {
                Ok(doc) if !doc.deleted => {
                    local.remove(&doc).await?;
                }
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            },
            Operation::Sync => {}
        }
        Ok(())
    }
}

#[async_trait]
impl HealthSubject for Inner {
    fn wants_probe(&self) -> bool {
        let rt = lock(&self.runtime);
        rt.initialized && rt.online && !rt.paused && self.remote.is_some()
    }

    async fn probe(&self) -> Result<()> {
        match &self.remote {
            Some(remote) => remote.info().await.map(|_| ()),
            None => Err(SyncError::Offline),
        }
    }

    fn on_verdict(&self, verdict: HealthVerdict) {
        match verdict {
            HealthVerdict::WentOffline => {
                if self.status() != SyncStatus::Paused {
                    warn!("Remote failed repeated health probes, going offline");
                    self.set_status(SyncStatus::Offline);
                }
            }
            HealthVerdict::Recovered => {
                let online = lock(&self.runtime).online;
                if online && self.status() == SyncStatus::Offline {
                    info!("Remote recovered, back to idle");
                    self.set_status(SyncStatus::Idle);
                }
            }
            HealthVerdict::Unchanged => {}
        }
    }
}

/// Builder for [`SyncOrchestrator`].
pub struct OrchestratorBuilder {
    local: Arc<dyn DocumentStore>,
    state: Arc<dyn StateStore>,
    remote: Option<Arc<dyn RemoteTransport>>,
    backup: Option<Arc<dyn BackupProvider>>,
    config: SyncConfig,
    clock: SharedClock,
    reloaders: Vec<Arc<dyn StateReloader>>,
}

impl OrchestratorBuilder {
    /// Without a remote the orchestrator stays `Offline`.
    pub fn remote(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.remote = Some(transport);
        self
    }

    pub fn backup(mut self, provider: Arc<dyn BackupProvider>) -> Self {
        self.backup = Some(provider);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn reloader(mut self, reloader: Arc<dyn StateReloader>) -> Self {
        self.reloaders.push(reloader);
        self
    }

    pub fn build(self) -> SyncOrchestrator {
        let config = self.config;
        let retry = RetryEngine::new(config.retry.clone());
        let queue = OfflineQueue::new(
            self.state.clone(),
            retry.clone(),
            config.queue.clone(),
            self.clock.clone(),
        );
        let (status, _) = watch::channel(SyncStatus::Idle);

        SyncOrchestrator {
            inner: Arc::new(Inner {
                local: self.local,
                remote: self.remote,
                state: self.state,
                backup: self.backup,
                retry,
                detector: ConflictDetector::new(&config.conflict),
                resolver: ConflictResolver::new(&config.conflict),
                queue,
                circuit: Mutex::new(CircuitBreaker::new(config.circuit.clone())),
                ledger: tokio::sync::Mutex::new(SyncLedger::new()),
                metrics: Mutex::new(SyncMetrics::default()),
                conflicts: Mutex::new(BTreeMap::new()),
                conflict_bus: Arc::new(EventBus::new()),
                events: Arc::new(EventBus::new()),
                reloaders: self.reloaders,
                status,
                runtime: Mutex::new(Runtime::default()),
                cycle: tokio::sync::Mutex::new(()),
                health: HealthMonitor::new(config.health.clone(), self.clock.clone()),
                clock: self.clock,
                config,
            }),
        }
    }
}

/// Replication service. Cheap to clone; all clones share one state machine.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn builder(local: Arc<dyn DocumentStore>, state: Arc<dyn StateStore>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            local,
            state,
            remote: None,
            backup: None,
            config: SyncConfig::default(),
            clock: system_clock(),
            reloaders: Vec::new(),
        }
    }

    /// Load persisted state and start health monitoring. Idempotent.
    pub async fn init(&self) -> Result<()> {
        let inner = &self.inner;
        if lock(&inner.runtime).initialized {
            return Ok(());
        }

        let ledger = SyncLedger::load(inner.state.as_ref()).await?;
        let tracked = ledger.len();
        *inner.ledger.lock().await = ledger;
        let metrics = SyncMetrics::load(inner.state.as_ref()).await?;
        *lock(&inner.metrics) = metrics;
        let pending = Conflict::load_all(inner.state.as_ref()).await?;
        let held = pending.len();
        *lock(&inner.conflicts) = pending.into_iter().map(|c| (c.id.clone(), c)).collect();
        let queued = inner.queue.len().await?;

        let online = {
            let mut rt = lock(&inner.runtime);
            rt.initialized = true;
            rt.paused = false;
            rt.started_at = Some(inner.now());
            rt.online
        };

        if inner.remote.is_some() && online {
            inner.set_status(SyncStatus::Idle);
            self.start_health();
        } else {
            inner.set_status(SyncStatus::Offline);
        }
        info!(
            "Sync orchestrator ready: {} tracked document(s), {} queued operation(s), {} pending conflict(s)",
            tracked, queued, held
        );
        Ok(())
    }

    /// Stop background work and persist state. Waits for an in-flight cycle.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        inner.health.stop();
        let _cycle = inner.cycle.lock().await;
        inner.ledger.lock().await.save(inner.state.as_ref()).await?;
        let metrics = lock(&inner.metrics).clone();
        metrics.save(inner.state.as_ref()).await?;
        lock(&inner.runtime).initialized = false;
        info!("Sync orchestrator stopped");
        Ok(())
    }

    fn start_health(&self) {
        let subject: Weak<dyn HealthSubject> = Arc::downgrade(&self.inner) as Weak<dyn HealthSubject>;
        self.inner.health.start(subject);
    }

    /// User-initiated sync. Throttled by the manual cooldown; drains the
    /// offline queue after a successful cycle.
    pub async fn trigger_sync(&self) -> Result<CycleReport> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let report = {
            let _cycle = inner.cycle.try_lock().map_err(|_| {
                warn!("Sync already in progress, ignoring trigger");
                SyncError::AlreadySyncing
            })?;

            let now = inner.now();
            {
                let mut rt = lock(&inner.runtime);
                if let Some(last) = rt.last_manual_trigger {
                    let cooldown = inner.config.orchestrator.manual_cooldown_ms;
                    let elapsed = now.saturating_sub(last);
                    if elapsed < cooldown {
                        return Err(SyncError::Throttled {
                            remaining_ms: cooldown - elapsed,
                        });
                    }
                }
                rt.last_manual_trigger = Some(now);
            }

            self.run_cycle().await?
        };

        if !inner.queue.is_empty().await? {
            if let Err(e) = self.process_queue().await {
                warn!("Failed to drain offline queue after sync: {}", e);
            }
        }
        Ok(report)
    }

    /// Scheduled sync: same as `trigger_sync` without the manual cooldown.
    pub async fn sync(&self) -> Result<CycleReport> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let _cycle = inner.cycle.try_lock().map_err(|_| SyncError::AlreadySyncing)?;
        self.run_cycle().await
    }

    /// Caller holds the cycle lock.
    async fn run_cycle(&self) -> Result<CycleReport> {
        let inner = &self.inner;
        let started = inner.now();

        let gate = lock(&inner.circuit).begin_attempt(started);
        if let Err(e) = gate {
            if matches!(e, SyncError::CircuitOpen) {
                inner.defer_sync().await?;
            }
            debug!("Sync attempt refused: {}", e);
            return Err(e);
        }

        match self.cycle_steps().await {
            Ok(mut report) => {
                let now = inner.now();
                report.duration_ms = now.saturating_sub(started);
                lock(&inner.circuit).record_success(now, report.duration_ms);
                {
                    let mut metrics = lock(&inner.metrics);
                    metrics.record_success(now, report.duration_ms);
                    metrics.record_conflicts(report.conflicts_detected as u64);
                    metrics.record_resolved(report.auto_resolved as u64);
                }
                inner.save_metrics().await;
                lock(&inner.runtime).last_error = None;

                inner.set_status(SyncStatus::Complete);
                inner.reload_dependents().await;
                inner.set_status(SyncStatus::Idle);

                info!(
                    "Sync complete: {} pushed, {} pulled, {} pending conflict(s) in {}ms",
                    report.pushed, report.pulled, report.pending_conflicts, report.duration_ms
                );
                inner.events.emit(SyncEvent::CycleCompleted {
                    pushed: report.pushed,
                    pulled: report.pulled,
                    conflicts: report.conflicts_detected,
                    duration_ms: report.duration_ms,
                });
                Ok(report)
            }
            Err(e) => Err(self.fail_cycle(e, started).await),
        }
    }

    async fn cycle_steps(&self) -> Result<CycleReport> {
        let inner = &self.inner;
        let transport = inner.remote.as_ref().ok_or(SyncError::Offline)?;
        inner.validate("Pre-sync").await?;
        inner.set_status(SyncStatus::Syncing);

        let local: &dyn DocumentStore = inner.local.as_ref();
        let remote: &dyn RemoteTransport = transport.as_ref();
        let options = ReplicationOptions::default();
        let mut ledger = inner.ledger.lock().await;

        let push = {
            let base: &SyncLedger = &ledger;
            let opts = &options;
            inner
                .retry
                .execute_with_retry(move |_| remote.push(local, base, opts), "push", "local -> remote")
                .await?
        };
        absorb(&mut ledger, &push, Leg::Push);
        ledger.save(inner.state.as_ref()).await?;

        let pull = {
            let base: &SyncLedger = &ledger;
            let opts = &options;
            inner
                .retry
                .execute_with_retry(move |_| remote.pull(local, base, opts), "pull", "remote -> local")
                .await?
        };
        absorb(&mut ledger, &pull, Leg::Pull);
        ledger.save(inner.state.as_ref()).await?;

        for (id, message) in push.errors().chain(pull.errors()) {
            warn!("Failed to replicate {}: {}", id, message);
        }

        // The pull leg sees the fresher pair
        let mut diverged: BTreeMap<DocId, (Document, Document)> = BTreeMap::new();
        for (l, r) in push.conflicts().chain(pull.conflicts()) {
            diverged.insert(l.id.clone(), (l.clone(), r.clone()));
        }

        let mut detected = 0;
        let mut auto_resolved = 0;
        if !diverged.is_empty() {
            inner.set_status(SyncStatus::ResolvingConflicts);
            let now = inner.now();
            for (id, (l, r)) in diverged {
                let Some(conflict) = inner.detector.detect(&l, &r, ledger.base(&id), now) else {
                    continue;
                };
                let is_new = !lock(&inner.conflicts).contains_key(&conflict.id);
                if is_new {
                    detected += 1;
                }

                if !conflict.auto_resolvable {
                    info!(
                        "Conflict on {} needs manual resolution (fields: {:?})",
                        id, conflict.changed_fields
                    );
                    inner.hold_conflict(&conflict).await?;
                    if is_new {
                        inner.conflict_bus.emit(conflict);
                    }
                    continue;
                }

                let resolution = inner.resolver.resolve(&conflict, ResolutionStrategy::Merge)?;
                match inner.resolver.apply(&resolution, local).await {
                    Ok(rev) => debug!("Merged {} locally at {}", id, rev),
                    Err(SyncError::RevisionConflict { .. }) => {
                        // Local kept moving; the next cycle sees it again
                        warn!("Failed to merge {}: local changed during write-back", id);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                ledger.record(conflict.remote.clone());
                inner.drop_conflict(&conflict).await?;
                auto_resolved += 1;
                inner.events.emit(SyncEvent::ConflictResolved {
                    conflict_id: conflict.id,
                    strategy: ResolutionStrategy::Merge.to_string(),
                });
            }
        }

        let mut pushed = push.written.len();
        if auto_resolved > 0 {
            inner.set_status(SyncStatus::Syncing);
            let follow_up = {
                let base: &SyncLedger = &ledger;
                let opts = &options;
                inner
                    .retry
                    .execute_with_retry(
                        move |_| remote.push(local, base, opts),
                        "push",
                        "merged documents",
                    )
                    .await?
            };
            pushed += follow_up.written.len();
            absorb(&mut ledger, &follow_up, Leg::Push);
        }
        ledger.save(inner.state.as_ref()).await?;
        drop(ledger);

        inner.validate("Post-sync").await?;

        Ok(CycleReport {
            pushed,
            pulled: pull.written.len(),
            conflicts_detected: detected,
            auto_resolved,
            pending_conflicts: lock(&inner.conflicts).len(),
            duration_ms: 0,
        })
    }

    /// Book-keeping for a failed cycle. Returns the error to surface.
    async fn fail_cycle(&self, error: SyncError, started: u64) -> SyncError {
        let inner = &self.inner;
        let now = inner.now();

        if is_cancellation(&error) || lock(&inner.runtime).paused {
            info!("Sync cycle cancelled: {}", error);
            return error;
        }

        lock(&inner.circuit).record_failure(now, &error.to_string());
        lock(&inner.metrics).record_failure(now.saturating_sub(started));
        inner.save_metrics().await;

        let critical = error.is_critical();
        let (error, operator_message) = if critical {
            let message = inner.critical_message(&error, now).await;
            error!("{}", message);
            (SyncError::Critical(message.clone()), Some(message))
        } else {
            error!("Sync cycle failed: {}", error);
            (error, None)
        };

        lock(&inner.runtime).last_error = Some(error.to_string());
        inner.set_status(SyncStatus::Error);
        inner.events.emit(SyncEvent::CycleFailed {
            error: error.to_string(),
            critical,
            operator_message,
        });
        error
    }

    /// Push local changes now, outside a full cycle.
    async fn deliver(&self) -> Result<usize> {
        let inner = &self.inner;
        let transport = inner.ensure_ready()?;
        if !lock(&inner.circuit).is_admitting(inner.now()) {
            return Err(SyncError::CircuitOpen);
        }

        let _cycle = inner.cycle.lock().await;
        let started = inner.now();
        let local: &dyn DocumentStore = inner.local.as_ref();
        let remote: &dyn RemoteTransport = transport.as_ref();
        let options = ReplicationOptions::default();
        let mut ledger = inner.ledger.lock().await;

        let result = {
            let base: &SyncLedger = &ledger;
            let opts = &options;
            inner
                .retry
                .execute_with_retry(move |_| remote.push(local, base, opts), "push", "deliver")
                .await
        };

        let now = inner.now();
        match result {
            Ok(report) => {
                for (l, _) in report.conflicts() {
                    debug!("{} diverged, left for the next cycle", l.id);
                }
                absorb(&mut ledger, &report, Leg::Push);
                ledger.save(inner.state.as_ref()).await?;
                lock(&inner.circuit).record_success(now, now.saturating_sub(started));
                Ok(report.written.len())
            }
            Err(e) => {
                if !is_cancellation(&e) {
                    lock(&inner.circuit).record_failure(now, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Apply `operation` locally and deliver it, or queue the delivery when
    /// the remote can't take it right now.
    pub async fn submit(&self, operation: Operation) -> Result<Submission> {
        let priority = match operation {
            Operation::Sync => Priority::Low,
            _ => Priority::Normal,
        };
        self.submit_with_priority(operation, priority).await
    }

    pub async fn submit_with_priority(
        &self,
        operation: Operation,
        priority: Priority,
    ) -> Result<Submission> {
        let inner = &self.inner;
        if !lock(&inner.runtime).initialized {
            return Err(SyncError::NotInitialized);
        }

        if operation == Operation::Sync {
            return match self.sync().await {
                Ok(_) | Err(SyncError::AlreadySyncing) => Ok(Submission::Delivered),
                Err(e) if worth_queueing(&e) => Ok(Submission::Queued {
                    operation_id: inner.defer_sync().await?,
                }),
                Err(e) => Err(e),
            };
        }

        inner.apply_local(&operation).await?;
        match self.deliver().await {
            Ok(_) => Ok(Submission::Delivered),
            Err(e) if worth_queueing(&e) => {
                let operation_id = inner.queue.enqueue(operation, priority).await?;
                info!("Remote unavailable ({}), queued {}", e, operation_id);
                Ok(Submission::Queued { operation_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the offline queue.
    pub async fn process_queue(&self) -> Result<DrainReport> {
        let report = self.inner.queue.process_queue(self).await?;
        for (operation_id, error) in &report.failed {
            self.inner.events.emit(SyncEvent::OperationFailed {
                operation_id: operation_id.clone(),
                error: error.clone(),
            });
        }
        Ok(report)
    }

    /// Network signal. Going online drains the offline queue.
    pub async fn set_online(&self, online: bool) -> Result<DrainReport> {
        let inner = &self.inner;
        let (changed, initialized) = {
            let mut rt = lock(&inner.runtime);
            let changed = rt.online != online;
            rt.online = online;
            (changed, rt.initialized)
        };
        if changed {
            info!("Network {}", if online { "online" } else { "offline" });
        }
        if !initialized {
            return Ok(DrainReport::default());
        }

        if !online {
            if inner.status() != SyncStatus::Paused {
                inner.set_status(SyncStatus::Offline);
            }
            return Ok(DrainReport::default());
        }

        if inner.remote.is_none() || inner.status() == SyncStatus::Paused {
            return Ok(DrainReport::default());
        }
        if inner.status() == SyncStatus::Offline && !inner.health.is_forced_offline() {
            inner.set_status(SyncStatus::Idle);
        }
        self.start_health();
        self.process_queue().await
    }

    /// Cancel in-flight replication and stop background probing.
    pub fn pause_sync(&self) {
        let inner = &self.inner;
        if let Some(remote) = &inner.remote {
            remote.cancel();
        }
        inner.health.stop();
        lock(&inner.runtime).paused = true;
        inner.set_status(SyncStatus::Paused);
        info!("Sync paused");
    }

    /// Start over: transport, breaker and health are reset and persisted
    /// state is reloaded.
    pub async fn resume_sync(&self) -> Result<()> {
        let inner = &self.inner;
        if let Some(remote) = &inner.remote {
            remote.reset();
        }
        {
            let mut rt = lock(&inner.runtime);
            rt.paused = false;
            rt.initialized = false;
            rt.last_error = None;
        }
        inner.health.reset();
        lock(&inner.circuit).reset();
        info!("Sync resumed");
        self.init().await
    }

    /// Resolve a pending conflict by hand and push the result (best effort).
    pub async fn manual_resolve(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Revision> {
        let inner = &self.inner;
        if !lock(&inner.runtime).initialized {
            return Err(SyncError::NotInitialized);
        }
        let conflict = lock(&inner.conflicts)
            .get(conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;

        let resolution = inner.resolver.resolve(&conflict, strategy)?;
        let rev = inner.resolver.apply(&resolution, inner.local.as_ref()).await?;
        {
            let mut ledger = inner.ledger.lock().await;
            ledger.record(conflict.remote.clone());
            ledger.save(inner.state.as_ref()).await?;
        }
        inner.drop_conflict(&conflict).await?;
        lock(&inner.metrics).record_resolved(1);
        inner.save_metrics().await;
        inner.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            strategy: strategy.to_string(),
        });
        info!("Resolved {} with {}", conflict_id, strategy);

        if let Err(e) = self.deliver().await {
            warn!("Failed to push resolution of {}: {}", conflict_id, e);
            if worth_queueing(&e) {
                inner.defer_sync().await?;
            }
        }
        Ok(rev)
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Conflicts that need a human, as they are detected.
    pub fn subscribe_conflicts(&self) -> Subscription<Conflict> {
        self.inner.conflict_bus.subscribe()
    }

    pub fn subscribe_events(&self) -> Subscription<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        lock(&self.inner.conflicts).values().cloned().collect()
    }

    pub fn sync_metrics(&self) -> SyncMetrics {
        lock(&self.inner.metrics).clone()
    }

    pub async fn reset_metrics(&self) -> Result<()> {
        let metrics = {
            let mut metrics = lock(&self.inner.metrics);
            metrics.reset();
            metrics.clone()
        };
        metrics.save(self.inner.state.as_ref()).await?;
        Ok(())
    }

    pub async fn sync_health(&self) -> Result<SyncHealth> {
        let inner = &self.inner;
        let queue_stats = inner.queue.stats().await?;
        let now = inner.now();
        let status = inner.status();
        let (online, last_error, uptime_ms) = {
            let rt = lock(&inner.runtime);
            (
                rt.online,
                rt.last_error.clone(),
                rt.started_at.map(|s| now.saturating_sub(s)).unwrap_or(0),
            )
        };
        let probe = inner.health.snapshot();

        Ok(SyncHealth {
            status,
            conflict_count: lock(&inner.conflicts).len(),
            has_errors: status == SyncStatus::Error || last_error.is_some(),
            last_error,
            queue_stats,
            is_online: online && inner.remote.is_some() && !probe.forced_offline,
            uptime_ms,
            last_sync_time: lock(&inner.metrics).last_sync_time,
            circuit: lock(&inner.circuit).metrics(),
            probe,
        })
    }

    pub fn local(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.local
    }
}

#[async_trait]
impl OperationExecutor for SyncOrchestrator {
    async fn execute(&self, operation: &Operation) -> Result<()> {
        match operation {
            Operation::Sync => match self.sync().await {
                // A cycle just ran or is running
                Ok(_) | Err(SyncError::AlreadySyncing) | Err(SyncError::Throttled { .. }) => Ok(()),
                Err(e) => Err(e),
            },
            op => {
                self.inner.apply_local(op).await?;
                self.deliver().await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupInfo, StaticBackupProvider};
    use crate::clock::ManualClock;
    use crate::conflict::CONFLICT_PREFIX;
    use crate::state::InMemoryStateStore;
    use crate::store::InMemoryStore;
    use crate::transport::StoreTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const START: u64 = 1_700_000_000_000;

    struct Fixture {
        local: Arc<InMemoryStore>,
        remote: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        orch: SyncOrchestrator,
    }

    impl Fixture {
        /// Manual sync after the cooldown has passed.
        async fn sync(&self) -> Result<CycleReport> {
            self.clock.advance(Duration::from_secs(6));
            self.orch.trigger_sync().await
        }

        async fn edit(store: &InMemoryStore, id: &str, field: &str, value: serde_json::Value) {
            let mut doc = store.get(id).await.unwrap();
            doc.set_field(field, value);
            store.put(doc).await.unwrap();
        }
    }

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.retry.max_attempts = 1;
        config.retry.jitter = false;
        config.health.interval_ms = 3_600_000;
        config
    }

    fn build(
        config: SyncConfig,
        backup: Option<Arc<dyn BackupProvider>>,
        state: Arc<InMemoryStateStore>,
    ) -> Fixture {
        let local = Arc::new(InMemoryStore::new());
        let remote = Arc::new(InMemoryStore::new());
        let clock = ManualClock::shared(START);
        let mut builder = SyncOrchestrator::builder(local.clone(), state)
            .remote(Arc::new(StoreTransport::new(remote.clone())))
            .config(config)
            .clock(clock.clone());
        if let Some(backup) = backup {
            builder = builder.backup(backup);
        }
        Fixture {
            local,
            remote,
            clock,
            orch: builder.build(),
        }
    }

    async fn fixture(config: SyncConfig) -> Fixture {
        let f = build(config, None, Arc::new(InMemoryStateStore::new()));
        f.orch.init().await.unwrap();
        f
    }

    #[tokio::test]
    async fn test_requires_init() {
        let f = build(test_config(), None, Arc::new(InMemoryStateStore::new()));
        assert!(matches!(
            f.orch.trigger_sync().await,
            Err(SyncError::NotInitialized)
        ));
        f.orch.init().await.unwrap();
        assert_eq!(f.orch.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_replication_is_idempotent() {
        let f = fixture(test_config()).await;
        f.local.put(Document::new("a").with_field("x", 1)).await.unwrap();
        f.local.put(Document::new("b").with_field("x", 2)).await.unwrap();
        f.remote.put(Document::new("c").with_field("x", 3)).await.unwrap();

        let first = f.sync().await.unwrap();
        assert_eq!(first.pushed, 2);
        assert_eq!(first.pulled, 1);

        let local_seq = f.local.info().await.unwrap().update_seq;
        let remote_seq = f.remote.info().await.unwrap().update_seq;

        let second = f.sync().await.unwrap();
        assert_eq!((second.pushed, second.pulled), (0, 0));
        assert_eq!(second.conflicts_detected, 0);
        assert_eq!(f.orch.sync_metrics().conflicts_detected, 0);
        assert_eq!(f.local.info().await.unwrap().update_seq, local_seq);
        assert_eq!(f.remote.info().await.unwrap().update_seq, remote_seq);

        for id in ["a", "b", "c"] {
            let l = f.local.get(id).await.unwrap();
            let r = f.remote.get(id).await.unwrap();
            assert_eq!(l.rev, r.rev);
            assert!(l.same_content(&r));
        }
        assert_eq!(f.orch.sync_metrics().successful_syncs, 2);
        assert_eq!(f.orch.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_same_field_clash_waits_for_manual_resolution() {
        let f = fixture(test_config()).await;
        f.local
            .put(Document::new("t1").with_field("title", "Draft"))
            .await
            .unwrap();
        f.sync().await.unwrap();

        Fixture::edit(&f.local, "t1", "title", json!("Local title")).await;
        Fixture::edit(&f.remote, "t1", "title", json!("Remote title")).await;

        let mut conflicts = f.orch.subscribe_conflicts();
        let report = f.sync().await.unwrap();
        assert_eq!(report.conflicts_detected, 1);
        assert_eq!(report.auto_resolved, 0);
        assert_eq!(report.pending_conflicts, 1);

        let conflict = conflicts.try_recv().unwrap();
        assert_eq!(conflict.id, "t1-conflict");
        assert!(!conflict.auto_resolvable);
        assert!(conflict.changed_fields.contains("title"));
        assert_eq!(f.orch.sync_health().await.unwrap().conflict_count, 1);

        f.orch
            .manual_resolve("t1-conflict", ResolutionStrategy::RemoteWins)
            .await
            .unwrap();

        let local = f.local.get("t1").await.unwrap();
        let remote = f.remote.get("t1").await.unwrap();
        assert_eq!(local.field("title"), Some(&json!("Remote title")));
        assert_eq!(local.rev, remote.rev);
        assert!(local.same_content(&remote));
        assert!(f.orch.pending_conflicts().is_empty());

        let metrics = f.orch.sync_metrics();
        assert_eq!(metrics.conflicts_detected, 1);
        assert_eq!(metrics.conflicts_resolved, 1);

        // Resolved divergence is not detected again
        let report = f.sync().await.unwrap();
        assert_eq!(report.conflicts_detected, 0);
        assert_eq!((report.pushed, report.pulled), (0, 0));
    }

    #[tokio::test]
    async fn test_pending_conflict_survives_restart() {
        let state = Arc::new(InMemoryStateStore::new());
        let f = build(test_config(), None, state.clone());
        f.orch.init().await.unwrap();
        f.local
            .put(Document::new("t1").with_field("title", "Draft"))
            .await
            .unwrap();
        f.sync().await.unwrap();

        Fixture::edit(&f.local, "t1", "title", json!("A")).await;
        Fixture::edit(&f.remote, "t1", "title", json!("B")).await;
        assert_eq!(f.sync().await.unwrap().pending_conflicts, 1);
        f.orch.shutdown().await.unwrap();

        // Same stores and state, fresh process
        let restarted = SyncOrchestrator::builder(f.local.clone(), state.clone())
            .remote(Arc::new(StoreTransport::new(f.remote.clone())))
            .config(test_config())
            .clock(f.clock.clone())
            .build();
        restarted.init().await.unwrap();
        let pending = restarted.pending_conflicts();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t1-conflict");

        for _ in 0..3 {
            f.clock.advance(Duration::from_secs(6));
            let report = restarted.trigger_sync().await.unwrap();
            assert_eq!(report.conflicts_detected, 0);
            assert_eq!(report.pending_conflicts, 1);
        }

        restarted
            .manual_resolve("t1-conflict", ResolutionStrategy::LocalWins)
            .await
            .unwrap();
        let local = f.local.get("t1").await.unwrap();
        let remote = f.remote.get("t1").await.unwrap();
        assert_eq!(local.field("title"), Some(&json!("A")));
        assert_eq!(local.rev, remote.rev);
        assert!(restarted.pending_conflicts().is_empty());
        assert!(state.keys(CONFLICT_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conflict_id() {
        let f = fixture(test_config()).await;
        assert!(matches!(
            f.orch
                .manual_resolve("nope-conflict", ResolutionStrategy::LocalWins)
                .await,
            Err(SyncError::ConflictNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disjoint_edits_merge_and_converge() {
        let mut config = test_config();
        config.conflict.counter_fields = vec!["pomodoros".into()];
        let f = fixture(config).await;
        let doc = Document::from_json("t1", json!({"title": "Draft", "notes": "", "pomodoros": 1}));
        f.local.put(doc).await.unwrap();
        f.sync().await.unwrap();

        Fixture::edit(&f.local, "t1", "title", json!("Local title")).await;
        Fixture::edit(&f.local, "t1", "pomodoros", json!(3)).await;
        Fixture::edit(&f.remote, "t1", "notes", json!("Remote notes")).await;
        Fixture::edit(&f.remote, "t1", "pomodoros", json!(2)).await;

        let mut events = f.orch.subscribe_events();
        let report = f.sync().await.unwrap();
        assert_eq!(report.conflicts_detected, 1);
        assert_eq!(report.auto_resolved, 1);
        assert_eq!(report.pending_conflicts, 0);

        let local = f.local.get("t1").await.unwrap();
        let remote = f.remote.get("t1").await.unwrap();
        assert_eq!(local.rev, remote.rev);
        assert_eq!(
            serde_json::Value::Object(local.body.clone()),
            json!({"title": "Local title", "notes": "Remote notes", "pomodoros": 3})
        );
        assert!(local.same_content(&remote));

        assert!(matches!(
            events.try_recv(),
            Some(SyncEvent::ConflictResolved { .. })
        ));

        let again = f.sync().await.unwrap();
        assert_eq!((again.pushed, again.pulled, again.conflicts_detected), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_breaker_opens_queues_and_recovers() {
        let mut config = test_config();
        config.circuit.max_consecutive_errors = 2;
        let f = fixture(config).await;
        f.remote
            .fail_with(Some(StoreError::Unavailable("remote down".into())));

        assert!(f.sync().await.is_err());
        assert!(f.sync().await.is_err());
        assert_eq!(f.orch.status(), SyncStatus::Error);

        assert!(matches!(f.sync().await, Err(SyncError::CircuitOpen)));
        assert!(matches!(f.sync().await, Err(SyncError::CircuitOpen)));
        let health = f.orch.sync_health().await.unwrap();
        assert_eq!(health.queue_stats.pending, 1);
        assert!(health.has_errors);

        f.remote.fail_with(None);
        f.clock.advance(Duration::from_secs(31));
        f.sync().await.unwrap();

        let health = f.orch.sync_health().await.unwrap();
        assert_eq!(health.circuit.state, crate::circuit::CircuitState::Closed);
        assert_eq!(health.queue_stats.pending, 0);
        assert!(!health.has_errors);
        assert_eq!(f.orch.sync_metrics().failed_syncs, 2);
    }

    #[tokio::test]
    async fn test_reentrant_and_rapid_triggers_are_rejected() {
        let f = fixture(test_config()).await;
        f.sync().await.unwrap();
        assert!(matches!(
            f.orch.trigger_sync().await,
            Err(SyncError::Throttled { .. })
        ));

        let _held = f.orch.inner.cycle.lock().await;
        f.clock.advance(Duration::from_secs(6));
        assert!(matches!(
            f.orch.trigger_sync().await,
            Err(SyncError::AlreadySyncing)
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let f = fixture(test_config()).await;
        f.orch.pause_sync();
        assert_eq!(f.orch.status(), SyncStatus::Paused);
        assert!(matches!(f.sync().await, Err(SyncError::Paused)));

        f.orch.resume_sync().await.unwrap();
        assert_eq!(f.orch.status(), SyncStatus::Idle);
        f.local.put(Document::new("a")).await.unwrap();
        assert_eq!(f.sync().await.unwrap().pushed, 1);
    }

    #[tokio::test]
    async fn test_offline_submit_is_queued_and_delivered_when_online() {
        let f = fixture(test_config()).await;
        f.orch.set_online(false).await.unwrap();
        assert_eq!(f.orch.status(), SyncStatus::Offline);

        let doc = Document::new("t2").with_field("title", "Written offline");
        let outcome = f.orch.submit(Operation::Create(doc)).await.unwrap();
        assert!(matches!(outcome, Submission::Queued { .. }));
        assert!(f.local.get("t2").await.is_ok());
        assert!(matches!(
            f.remote.get("t2").await,
            Err(StoreError::NotFound(_))
        ));

        let drained = f.orch.set_online(true).await.unwrap();
        assert_eq!(drained.succeeded.len(), 1);
        assert_eq!(f.orch.status(), SyncStatus::Idle);
        let local = f.local.get("t2").await.unwrap();
        let remote = f.remote.get("t2").await.unwrap();
        assert_eq!(local.rev, remote.rev);
    }

    #[tokio::test]
    async fn test_online_submit_is_delivered_immediately() {
        let f = fixture(test_config()).await;
        f.local.put(Document::new("t3").with_field("done", false)).await.unwrap();

        let mut delta = crate::document::Body::new();
        delta.insert("done".into(), json!(true));
        let outcome = f
            .orch
            .submit(Operation::Update {
                id: "t3".into(),
                delta,
            })
            .await
            .unwrap();
        assert_eq!(outcome, Submission::Delivered);
        assert_eq!(
            f.remote.get("t3").await.unwrap().field("done"),
            Some(&json!(true))
        );
    }

    #[tokio::test]
    async fn test_queued_work_survives_restart() {
        let state = Arc::new(InMemoryStateStore::new());
        let first = build(test_config(), None, state.clone());
        first.orch.init().await.unwrap();
        first.orch.set_online(false).await.unwrap();
        first
            .orch
            .submit(Operation::Delete { id: "gone".into() })
            .await
            .unwrap();
        first.orch.shutdown().await.unwrap();
        drop(first);

        let second = build(test_config(), None, state);
        second.orch.init().await.unwrap();
        assert_eq!(second.orch.sync_health().await.unwrap().queue_stats.pending, 1);
        let report = second.orch.process_queue().await.unwrap();
        assert_eq!(report.succeeded.len(), 1);
        assert!(second.orch.process_queue().await.unwrap().succeeded.is_empty());
    }

    #[tokio::test]
    async fn test_critical_failure_reports_recent_backup() {
        let backup = Arc::new(StaticBackupProvider::new(Some(BackupInfo {
            location: "/backups/latest".into(),
            created_at: START - 12 * 60_000,
            document_count: 3,
        })));
        let f = build(test_config(), Some(backup), Arc::new(InMemoryStateStore::new()));
        f.orch.init().await.unwrap();
        let mut events = f.orch.subscribe_events();

        f.local
            .fail_with(Some(StoreError::Corrupt("index page 7 corrupted".into())));
        let err = f.sync().await.unwrap_err();

        match &err {
            SyncError::Critical(message) => {
                assert!(message.contains("12 minutes"));
                assert!(message.contains("/backups/latest"));
            }
            other => panic!("expected critical error, got {other:?}"),
        }
        assert_eq!(f.orch.status(), SyncStatus::Error);
        assert!(matches!(
            events.try_recv(),
            Some(SyncEvent::CycleFailed { critical: true, .. })
        ));
    }

    struct CountingReloader(AtomicUsize);

    #[async_trait]
    impl StateReloader for CountingReloader {
        fn name(&self) -> &str {
            "counter"
        }

        async fn reload(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_successful_cycle_reloads_dependents() {
        let reloader = Arc::new(CountingReloader(AtomicUsize::new(0)));
        let orch = SyncOrchestrator::builder(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryStateStore::new()),
        )
        .remote(Arc::new(StoreTransport::new(Arc::new(InMemoryStore::new()))))
        .config(test_config())
        .clock(ManualClock::shared(START))
        .reloader(reloader.clone())
        .build();
        orch.init().await.unwrap();

        orch.sync().await.unwrap();
        assert_eq!(reloader.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probes_force_offline_until_recovery() {
        let mut config = test_config();
        config.health.interval_ms = 1_000;
        let f = fixture(config).await;

        f.remote
            .fail_with(Some(StoreError::Unavailable("remote down".into())));
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(f.orch.status(), SyncStatus::Offline);
        assert!(!f.orch.sync_health().await.unwrap().is_online);
        assert!(matches!(f.sync().await, Err(SyncError::Offline)));

        f.remote.fail_with(None);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(f.orch.status(), SyncStatus::Idle);
    }
}

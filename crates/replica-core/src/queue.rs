//! Offline queue: durable, priority-ordered operations waiting for the remote.
//!
//! Each operation is its own state record `queue/{id}`, so a crash in the
//! middle of a drain loses nothing: `attempt_count` is written before every
//! attempt and the record is removed only after success or final failure.
//!
//! Drain order is `High`, then `Normal`, then `Low`; FIFO within a tier.
//! Operations run through the [`RetryEngine`] with the attempts they have
//! left. An operation that fails for good is dropped and reported in the
//! [`DrainReport`] instead of being raised to the caller.

use crate::clock::SharedClock;
use crate::config::QueueConfig;
use crate::document::{Body, DocId, Document};
use crate::error::{Result, SyncError};
use crate::retry::RetryEngine;
use crate::state::{self, StateStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Record key prefix.
pub const QUEUE_PREFIX: &str = "queue/";

fn record_key(id: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, id)
}

/// A deferred unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    Create(Document),
    Update { id: DocId, delta: Body },
    Delete { id: DocId },
    /// A full replication cycle.
    Sync,
}

impl Operation {
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Operation::Create(doc) => Some(&doc.id),
            Operation::Update { id, .. } | Operation::Delete { id } => Some(id),
            Operation::Sync => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create(_) => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Sync => "sync",
        }
    }
}

/// Drain tier. Sorts `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub operation: Operation,
    pub priority: Priority,
    pub max_retries: u32,
    pub attempt_count: u32,
    pub enqueued_at: u64,
    /// Tie-breaker within the same millisecond.
    #[serde(default)]
    pub seq: u64,
}

impl QueuedOperation {
    pub fn remaining_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempt_count)
    }

    fn order_key(&self) -> (Priority, u64, u64) {
        (self.priority, self.enqueued_at, self.seq)
    }
}

/// Executes one operation against the replicas.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &Operation) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub processing: bool,
    /// Operations dropped after their last attempt since this queue was opened.
    pub permanently_failed: u64,
}

/// What one `process_queue` call did.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// The call found another drain in progress and did nothing.
    pub skipped: bool,
    pub succeeded: Vec<String>,
    /// Dropped operations with the final error text.
    pub failed: Vec<(String, String)>,
    /// The drain stopped early because the remote is unavailable.
    pub halted: Option<String>,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Clears the draining flag even if the drain future is dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct OfflineQueue {
    state: Arc<dyn StateStore>,
    retry: RetryEngine,
    config: QueueConfig,
    clock: SharedClock,
    draining: AtomicBool,
    next_seq: AtomicU64,
    permanently_failed: AtomicU64,
}

impl OfflineQueue {
    pub fn new(
        state: Arc<dyn StateStore>,
        retry: RetryEngine,
        config: QueueConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            state,
            retry,
            config,
            clock,
            draining: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            permanently_failed: AtomicU64::new(0),
        }
    }

    /// Queue `operation` with the configured retry budget. Returns its id.
    pub async fn enqueue(&self, operation: Operation, priority: Priority) -> Result<String> {
        self.enqueue_with_retries(operation, priority, self.config.default_max_retries)
            .await
    }

    pub async fn enqueue_with_retries(
        &self,
        operation: Operation,
        priority: Priority,
        max_retries: u32,
    ) -> Result<String> {
        let queued = QueuedOperation {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            priority,
            max_retries: max_retries.max(1),
            attempt_count: 0,
            enqueued_at: self.clock.now_ms(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        state::save_record(self.state.as_ref(), &record_key(&queued.id), &queued).await?;
        debug!(
            "Queued {} {} ({:?})",
            queued.operation.kind(),
            queued.id,
            queued.priority
        );
        Ok(queued.id)
    }

    /// All queued operations in drain order.
    pub async fn pending(&self) -> Result<Vec<QueuedOperation>> {
        let keys = self.state.keys(QUEUE_PREFIX).await?;
        let mut ops = Vec::with_capacity(keys.len());
        for key in keys {
            match state::load_record::<QueuedOperation>(self.state.as_ref(), &key).await {
                Ok(Some(op)) => ops.push(op),
                Ok(None) => {}
                Err(e) => {
                    // Unreadable record: drop it rather than wedge the queue
                    warn!("Failed to read queued operation {}: {}", key, e);
                    self.state.delete(&key).await?;
                }
            }
        }
        ops.sort_by_key(QueuedOperation::order_key);
        Ok(ops)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.state.keys(QUEUE_PREFIX).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub fn is_processing(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let ops = self.pending().await?;
        let count = |p: Priority| ops.iter().filter(|op| op.priority == p).count();
        Ok(QueueStats {
            pending: ops.len(),
            high: count(Priority::High),
            normal: count(Priority::Normal),
            low: count(Priority::Low),
            processing: self.is_processing(),
            permanently_failed: self.permanently_failed.load(Ordering::SeqCst),
        })
    }

    /// Remove every queued operation.
    pub async fn clear(&self) -> Result<usize> {
        let keys = self.state.keys(QUEUE_PREFIX).await?;
        for key in &keys {
            self.state.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Drain the queue through `executor`.
    ///
    /// A no-op (with `skipped` set) when a drain is already running.
    pub async fn process_queue(&self, executor: &dyn OperationExecutor) -> Result<DrainReport> {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("Queue drain already in progress");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let ops = self.pending().await?;
        let mut report = DrainReport::default();
        if ops.is_empty() {
            return Ok(report);
        }
        info!("Draining {} queued operation(s)", ops.len());

        for op in ops {
            match self.run(&op, executor).await {
                Ok(()) => {
                    self.state.delete(&record_key(&op.id)).await?;
                    report.succeeded.push(op.id);
                }
                Err(e) if e.defers_work() => {
                    // Keep the op with its previous count; the attempt never reached the remote
                    state::save_record(self.state.as_ref(), &record_key(&op.id), &op).await?;
                    info!("Queue drain halted at {}: {}", op.id, e);
                    report.halted = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    error!(
                        "Failed to execute queued {} {}, dropping: {}",
                        op.operation.kind(),
                        op.id,
                        e
                    );
                    self.state.delete(&record_key(&op.id)).await?;
                    self.permanently_failed.fetch_add(1, Ordering::SeqCst);
                    report.failed.push((op.id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    async fn run(&self, op: &QueuedOperation, executor: &dyn OperationExecutor) -> Result<()> {
        let remaining = op.remaining_attempts();
        if remaining == 0 {
            return Err(SyncError::Permanent(format!(
                "no attempts left ({} of {})",
                op.attempt_count, op.max_retries
            )));
        }

        let state = self.state.as_ref();
        let key = record_key(&op.id);
        let key = key.as_str();
        let base_count = op.attempt_count;

        self.retry
            .execute_with_attempts(
                remaining,
                |attempt| {
                    let mut record = op.clone();
                    record.attempt_count = base_count + attempt;
                    async move {
                        state::save_record(state, key, &record).await?;
                        executor.execute(&record.operation).await
                    }
                },
                "queued operation",
                &op.id,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::state::InMemoryStateStore;
    use std::sync::Mutex;

    /// Records executed operations; fails according to `fail`.
    #[derive(Default)]
    struct Recorder {
        executed: Mutex<Vec<Operation>>,
        fail: Mutex<Option<fn(&Operation) -> Option<SyncError>>>,
    }

    #[async_trait]
    impl OperationExecutor for Recorder {
        async fn execute(&self, operation: &Operation) -> Result<()> {
            let fail = *self.fail.lock().unwrap();
            if let Some(err) = fail.and_then(|f| f(operation)) {
                return Err(err);
            }
            self.executed.lock().unwrap().push(operation.clone());
            Ok(())
        }
    }

    fn retry() -> RetryEngine {
        RetryEngine::new(RetryConfig {
            jitter: false,
            base_delay_ms: 10,
            ..Default::default()
        })
    }

    fn queue(state: Arc<dyn StateStore>, clock: Arc<ManualClock>) -> OfflineQueue {
        OfflineQueue::new(state, retry(), QueueConfig::default(), clock)
    }

    fn delete(id: &str) -> Operation {
        Operation::Delete { id: id.into() }
    }

    #[tokio::test]
    async fn test_drains_by_priority_then_fifo() {
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let clock = ManualClock::shared(1_000);
        let queue = queue(state, clock.clone());

        queue.enqueue(delete("low"), Priority::Low).await.unwrap();
        queue.enqueue(delete("n1"), Priority::Normal).await.unwrap();
        clock.set(2_000);
        queue.enqueue(delete("h1"), Priority::High).await.unwrap();
        queue.enqueue(delete("n2"), Priority::Normal).await.unwrap();

        let recorder = Recorder::default();
        let report = queue.process_queue(&recorder).await.unwrap();

        assert_eq!(report.succeeded.len(), 4);
        let order: Vec<_> = recorder
            .executed
            .lock()
            .unwrap()
            .iter()
            .map(|op| op.entity_id().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["h1", "n1", "n2", "low"]);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_survives_restart_without_loss_or_duplication() {
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let clock = ManualClock::shared(0);

        {
            let queue = queue(state.clone(), clock.clone());
            for i in 0..5 {
                queue.enqueue(delete(&format!("d{}", i)), Priority::Normal).await.unwrap();
            }
        }

        // Fresh queue over the same durable state
        let queue = queue(state, clock);
        assert_eq!(queue.len().await.unwrap(), 5);
        let recorder = Recorder::default();
        queue.process_queue(&recorder).await.unwrap();
        queue.process_queue(&recorder).await.unwrap();

        assert_eq!(recorder.executed.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_dropped_and_reported() {
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let queue = queue(state, ManualClock::shared(0));
        queue.enqueue(delete("bad"), Priority::Normal).await.unwrap();
        queue.enqueue(delete("good"), Priority::Normal).await.unwrap();

        let recorder = Recorder::default();
        fn fail_bad(op: &Operation) -> Option<SyncError> {
            (op.entity_id() == Some("bad")).then(|| SyncError::Transient("timeout".into()))
        }
        *recorder.fail.lock().unwrap() = Some(fail_bad);

        let report = queue.process_queue(&recorder).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.succeeded.len(), 1);
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(queue.stats().await.unwrap().permanently_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_count_never_exceeds_max_retries() {
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let queue = queue(state.clone(), ManualClock::shared(0));
        let id = queue
            .enqueue_with_retries(delete("x"), Priority::Normal, 2)
            .await
            .unwrap();

        /// Checks the persisted count while the attempt is running.
        struct Inspect {
            state: Arc<dyn StateStore>,
            key: String,
            seen: Mutex<Vec<u32>>,
        }

        #[async_trait]
        impl OperationExecutor for Inspect {
            async fn execute(&self, _: &Operation) -> Result<()> {
                let op: QueuedOperation = state::load_record(self.state.as_ref(), &self.key)
                    .await?
                    .unwrap();
                self.seen.lock().unwrap().push(op.attempt_count);
                Err(SyncError::Transient("down".into()))
            }
        }

        let inspect = Inspect {
            state,
            key: record_key(&id),
            seen: Mutex::new(Vec::new()),
        };
        queue.process_queue(&inspect).await.unwrap();
        assert_eq!(*inspect.seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_circuit_open_halts_and_keeps_operation() {
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let queue = queue(state, ManualClock::shared(0));
        queue.enqueue(delete("a"), Priority::Normal).await.unwrap();
        queue.enqueue(delete("b"), Priority::Normal).await.unwrap();

        let recorder = Recorder::default();
        fn circuit_open(_: &Operation) -> Option<SyncError> {
            Some(SyncError::CircuitOpen)
        }
        *recorder.fail.lock().unwrap() = Some(circuit_open);

        let report = queue.process_queue(&recorder).await.unwrap();
        assert!(report.halted.is_some());
        assert_eq!(report.processed(), 0);

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_empty_drain_is_noop() {
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let queue = queue(state, ManualClock::shared(0));
        let report = queue.process_queue(&Recorder::default()).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.processed(), 0);
        assert!(!queue.is_processing());
    }

    #[test]
    fn test_operation_serde_is_tagged() {
        let op = Operation::Update {
            id: "t1".into(),
            delta: serde_json::json!({"title": "B"}).as_object().unwrap().clone(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "update");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);

        let sync = serde_json::to_string(&Operation::Sync).unwrap();
        assert_eq!(sync, r#"{"type":"sync"}"#);
    }
}

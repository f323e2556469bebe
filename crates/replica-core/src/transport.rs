//! RemoteTransport trait for replication between the local and remote store.
//!
//! Implementations:
//! - `StoreTransport` - Replicates against any `DocumentStore` used as the remote
//!   (in-memory for tests, a directory for the daemon)
//!
//! A transport only moves documents whose other side is unchanged since the
//! ledger's base. Documents modified on both sides are reported as
//! [`ReplicationFailure::Conflict`] and left untouched for the conflict
//! detector and resolver.

use crate::document::{DocId, Document};
use crate::error::{ErrorCategory, Result, SyncError};
use crate::ledger::SyncLedger;
use crate::store::{Change, DocumentStore, StoreError, StoreInfo};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    #[error("Remote timed out: {0}")]
    Timeout(String),

    #[error("Remote rejected request: {0}")]
    Rejected(String),

    #[error("Replication cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Unreachable(_) | TransportError::Timeout(_) => ErrorCategory::Transient,
            TransportError::Rejected(_) => ErrorCategory::Permanent,
            TransportError::Cancelled => ErrorCategory::Control,
        }
    }
}

/// Per-call replication options.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Maximum changes handled in one call; the rest wait for the next cycle.
    pub batch_size: usize,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

/// A document that could not be replicated.
#[derive(Debug, Clone)]
pub enum ReplicationFailure {
    /// Both sides changed since the ledger base.
    Conflict { local: Document, remote: Document },
    /// The write itself failed; the document is retried next cycle.
    Error { id: DocId, message: String },
}

impl ReplicationFailure {
    pub fn id(&self) -> &str {
        match self {
            ReplicationFailure::Conflict { local, .. } => &local.id,
            ReplicationFailure::Error { id, .. } => id,
        }
    }
}

/// Outcome of one push or pull.
#[derive(Debug, Clone, Default)]
pub struct ReplicationReport {
    /// Documents written to the target side.
    pub written: Vec<Document>,
    /// Documents found already identical on both sides.
    pub in_sync: Vec<Document>,
    pub failures: Vec<ReplicationFailure>,
    /// Source update_seq processed up to.
    pub checkpoint: u64,
}

impl ReplicationReport {
    pub fn conflicts(&self) -> impl Iterator<Item = (&Document, &Document)> {
        self.failures.iter().filter_map(|f| match f {
            ReplicationFailure::Conflict { local, remote } => Some((local, remote)),
            ReplicationFailure::Error { .. } => None,
        })
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &str)> {
        self.failures.iter().filter_map(|f| match f {
            ReplicationFailure::Error { id, message } => Some((id.as_str(), message.as_str())),
            ReplicationFailure::Conflict { .. } => None,
        })
    }
}

/// Replication endpoint for the remote side.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Send local changes since the ledger's push checkpoint.
    async fn push(
        &self,
        local: &dyn DocumentStore,
        ledger: &SyncLedger,
        options: &ReplicationOptions,
    ) -> Result<ReplicationReport>;

    /// Fetch remote changes since the ledger's pull checkpoint.
    async fn pull(
        &self,
        local: &dyn DocumentStore,
        ledger: &SyncLedger,
        options: &ReplicationOptions,
    ) -> Result<ReplicationReport>;

    /// Lightweight reachability probe.
    async fn info(&self) -> Result<StoreInfo>;

    /// Abort any in-flight push/pull (best effort) and refuse new ones.
    fn cancel(&self);

    /// Accept push/pull again after `cancel`.
    fn reset(&self);
}

/// Reference transport replicating against another `DocumentStore`.
pub struct StoreTransport {
    remote: Arc<dyn DocumentStore>,
    cancelled: AtomicBool,
}

/// Which way a replication pass runs.
#[derive(Debug, Clone, Copy)]
enum Direction {
    Push,
    Pull,
}

impl StoreTransport {
    pub fn new(remote: Arc<dyn DocumentStore>) -> Self {
        Self {
            remote,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> &Arc<dyn DocumentStore> {
        &self.remote
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(TransportError::Cancelled.into());
        }
        Ok(())
    }

    async fn replicate(
        &self,
        direction: Direction,
        source: &dyn DocumentStore,
        target: &dyn DocumentStore,
        ledger: &SyncLedger,
        options: &ReplicationOptions,
    ) -> Result<ReplicationReport> {
        self.check_cancelled()?;

        let since = match direction {
            Direction::Push => ledger.push_checkpoint(),
            Direction::Pull => ledger.pull_checkpoint(),
        };
        let changes = source.changes(since).await?;
        let mut report = ReplicationReport {
            checkpoint: since,
            ..Default::default()
        };

        for Change { seq, doc, .. } in changes.into_iter().take(options.batch_size.max(1)) {
            self.check_cancelled()?;
            report.checkpoint = seq;

            let base_rev = ledger.base_rev(&doc.id);
            if doc.rev.is_some() && doc.rev.as_ref() == base_rev {
                // Arrived from the other side in an earlier pass
                continue;
            }

            let existing = match target.get(&doc.id).await {
                Ok(existing) => Some(existing),
                Err(StoreError::NotFound(_)) => None,
                Err(e) if e.category() == ErrorCategory::Transient => return Err(e.into()),
                Err(e) if e.category() == ErrorCategory::Critical => return Err(e.into()),
                Err(e) => {
                    report.failures.push(ReplicationFailure::Error {
                        id: doc.id.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            match existing {
                Some(existing) if existing.rev == doc.rev => report.in_sync.push(doc),
                Some(existing) if existing.rev.as_ref() != base_rev => {
                    let (local, remote) = match direction {
                        Direction::Push => (doc, existing),
                        Direction::Pull => (existing, doc),
                    };
                    debug!(
                        "Diverged {}: local {} remote {}",
                        local.id,
                        local.rev_string(),
                        remote.rev_string()
                    );
                    report
                        .failures
                        .push(ReplicationFailure::Conflict { local, remote });
                }
                _ => match target.force_put(doc.clone()).await {
                    Ok(()) => report.written.push(doc),
                    Err(e) if e.category() == ErrorCategory::Transient => return Err(e.into()),
                    Err(e) => report.failures.push(ReplicationFailure::Error {
                        id: doc.id.clone(),
                        message: e.to_string(),
                    }),
                },
            }
        }

        debug!(
            "{:?}: {} written, {} in sync, {} failures (checkpoint {})",
            direction,
            report.written.len(),
            report.in_sync.len(),
            report.failures.len(),
            report.checkpoint
        );
        Ok(report)
    }
}

#[async_trait]
impl RemoteTransport for StoreTransport {
    async fn push(
        &self,
        local: &dyn DocumentStore,
        ledger: &SyncLedger,
        options: &ReplicationOptions,
    ) -> Result<ReplicationReport> {
        self.replicate(Direction::Push, local, self.remote.as_ref(), ledger, options)
            .await
    }

    async fn pull(
        &self,
        local: &dyn DocumentStore,
        ledger: &SyncLedger,
        options: &ReplicationOptions,
    ) -> Result<ReplicationReport> {
        self.replicate(Direction::Pull, self.remote.as_ref(), local, ledger, options)
            .await
    }

    async fn info(&self) -> Result<StoreInfo> {
        self.remote.info().await.map_err(|e| match e.category() {
            ErrorCategory::Transient => {
                SyncError::Transport(TransportError::Unreachable(e.to_string()))
            }
            _ => SyncError::Store(e),
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<T: RemoteTransport + ?Sized> RemoteTransport for Arc<T> {
    async fn push(
        &self,
        local: &dyn DocumentStore,
        ledger: &SyncLedger,
        options: &ReplicationOptions,
    ) -> Result<ReplicationReport> {
        (**self).push(local, ledger, options).await
    }

    async fn pull(
        &self,
        local: &dyn DocumentStore,
        ledger: &SyncLedger,
        options: &ReplicationOptions,
    ) -> Result<ReplicationReport> {
        (**self).pull(local, ledger, options).await
    }

    async fn info(&self) -> Result<StoreInfo> {
        (**self).info().await
    }

    fn cancel(&self) {
        (**self).cancel()
    }

    fn reset(&self) {
        (**self).reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn setup() -> (Arc<InMemoryStore>, Arc<InMemoryStore>, StoreTransport) {
        let local = Arc::new(InMemoryStore::new());
        let remote = Arc::new(InMemoryStore::new());
        let transport = StoreTransport::new(remote.clone());
        (local, remote, transport)
    }

    fn absorb(ledger: &mut SyncLedger, report: &ReplicationReport, push: bool) {
        for doc in report.written.iter().chain(&report.in_sync) {
            ledger.record(doc.clone());
        }
        if push {
            ledger.advance_push(report.checkpoint);
        } else {
            ledger.advance_pull(report.checkpoint);
        }
    }

    #[tokio::test]
    async fn test_push_copies_new_documents() {
        let (local, remote, transport) = setup();
        local.put(Document::new("a").with_field("x", 1)).await.unwrap();
        local.put(Document::new("b")).await.unwrap();

        let ledger = SyncLedger::new();
        let report = transport
            .push(local.as_ref(), &ledger, &ReplicationOptions::default())
            .await
            .unwrap();

        assert_eq!(report.written.len(), 2);
        assert_eq!(report.checkpoint, 2);
        assert_eq!(remote.get("a").await.unwrap().rev, local.get("a").await.unwrap().rev);
    }

    #[tokio::test]
    async fn test_pull_fast_forwards_unchanged_local() {
        let (local, remote, transport) = setup();
        let mut ledger = SyncLedger::new();

        local.put(Document::new("a").with_field("x", 1)).await.unwrap();
        let report = transport
            .push(local.as_ref(), &ledger, &ReplicationOptions::default())
            .await
            .unwrap();
        absorb(&mut ledger, &report, true);

        // Remote edits the document; local did not
        let doc = remote.get("a").await.unwrap();
        remote.put(doc.with_field("x", 2)).await.unwrap();

        let report = transport
            .pull(local.as_ref(), &ledger, &ReplicationOptions::default())
            .await
            .unwrap();
        assert_eq!(report.written.len(), 1);
        assert!(report.failures.is_empty());
        assert_eq!(local.get("a").await.unwrap().field("x"), Some(&2.into()));
    }

    #[tokio::test]
    async fn test_both_sides_changed_is_reported_as_conflict() {
        let (local, remote, transport) = setup();
        let mut ledger = SyncLedger::new();

        local.put(Document::new("t1").with_field("title", "A")).await.unwrap();
        let report = transport
            .push(local.as_ref(), &ledger, &ReplicationOptions::default())
            .await
            .unwrap();
        absorb(&mut ledger, &report, true);

        let l = local.get("t1").await.unwrap();
        local.put(l.with_field("title", "L")).await.unwrap();
        let r = remote.get("t1").await.unwrap();
        remote.put(r.with_field("title", "R")).await.unwrap();

        let report = transport
            .push(local.as_ref(), &ledger, &ReplicationOptions::default())
            .await
            .unwrap();
        let conflicts: Vec<_> = report.conflicts().collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].0.field("title"), Some(&"L".into()));
        assert_eq!(conflicts[0].1.field("title"), Some(&"R".into()));
        // Nothing was overwritten
        assert_eq!(remote.get("t1").await.unwrap().field("title"), Some(&"R".into()));
    }

    #[tokio::test]
    async fn test_second_push_is_idempotent() {
        let (local, remote, transport) = setup();
        let mut ledger = SyncLedger::new();
        local.put(Document::new("a")).await.unwrap();

        let first = transport
            .push(local.as_ref(), &ledger, &ReplicationOptions::default())
            .await
            .unwrap();
        absorb(&mut ledger, &first, true);
        let seq_after_first = remote.info().await.unwrap().update_seq;

        let second = transport
            .push(local.as_ref(), &ledger, &ReplicationOptions::default())
            .await
            .unwrap();
        assert!(second.written.is_empty());
        assert_eq!(remote.info().await.unwrap().update_seq, seq_after_first);
    }

    #[tokio::test]
    async fn test_cancel_refuses_until_reset() {
        let (local, _remote, transport) = setup();
        transport.cancel();
        let err = transport
            .push(local.as_ref(), &SyncLedger::new(), &ReplicationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Cancelled)));

        transport.reset();
        assert!(transport
            .push(local.as_ref(), &SyncLedger::new(), &ReplicationOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_remote_probe_is_transient() {
        let (_local, remote, transport) = setup();
        remote.fail_with(Some(StoreError::Unavailable("down".into())));
        let err = transport.info().await.unwrap_err();
        assert!(err.is_retryable());
    }
}

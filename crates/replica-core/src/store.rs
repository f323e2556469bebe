//! DocumentStore trait abstraction over the local/remote document storage engine.
//!
//! The storage engine is an external collaborator; the sync core only needs
//! get/put/remove, a changes feed, and basic info. Implementations:
//! - `InMemoryStore` - For testing, and as the in-process "remote" in examples
//! - `DirStore` (in replica-daemon) - One JSON file per document via tokio::fs

use crate::document::{DocId, Document, Revision};
use crate::error::ErrorCategory;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the live changes feed. Slow watchers lag rather than block writers.
const WATCH_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(DocId),

    #[error("Revision conflict on {id}: expected {expected:?}, found {actual:?}")]
    RevisionConflict {
        id: DocId,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Invalid document: {0}")]
    Invalid(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store corrupted: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::NotFound(_) => ErrorCategory::Control,
            StoreError::RevisionConflict { .. } => ErrorCategory::RevisionConflict,
            StoreError::Invalid(_) => ErrorCategory::Permanent,
            StoreError::Corrupt(_) => ErrorCategory::Critical,
            StoreError::Unavailable(_) | StoreError::Io(_) => ErrorCategory::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One entry of the changes feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Store-local update sequence of this change.
    pub seq: u64,
    pub id: DocId,
    pub rev: Revision,
    pub deleted: bool,
    pub doc: Document,
}

/// Store summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreInfo {
    /// Live (non-deleted) documents.
    pub document_count: usize,
    /// Sequence of the latest change.
    pub update_seq: u64,
}

/// Document storage consumed by the sync core.
///
/// `get` returns tombstones (with `deleted == true`) so replication can
/// propagate deletions; callers that only want live documents check the flag.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the current version of a document.
    async fn get(&self, id: &str) -> Result<Document>;

    /// Write a document. `doc.rev` must equal the stored revision (or be
    /// `None` for a new document), otherwise fails with `RevisionConflict`.
    /// Returns the newly assigned revision.
    async fn put(&self, doc: Document) -> Result<Revision>;

    /// Replication write: store `doc` verbatim, keeping its revision.
    /// A no-op when the stored revision already equals `doc.rev`.
    async fn force_put(&self, doc: Document) -> Result<()>;

    /// Delete a document (writes a tombstone). Same revision rule as `put`.
    async fn remove(&self, doc: &Document) -> Result<Revision>;

    /// Changes after `since`, one entry per document (latest wins), in seq order.
    async fn changes(&self, since: u64) -> Result<Vec<Change>>;

    /// Live feed of changes as they happen.
    fn watch(&self) -> broadcast::Receiver<Change>;

    async fn info(&self) -> Result<StoreInfo>;

    /// All documents, tombstones included.
    async fn all_documents(&self) -> Result<Vec<Document>> {
        Ok(self.changes(0).await?.into_iter().map(|c| c.doc).collect())
    }
}

/// Checks the revision rule shared by every store implementation and
/// computes the next revision.
pub fn next_revision(current: Option<&Document>, doc: &Document) -> Result<Revision> {
    match (current, doc.rev.as_ref()) {
        (None, None) => Ok(Revision::initial(&doc.body, doc.deleted)),
        (Some(existing), supplied) if existing.rev.as_ref() == supplied => {
            let base = existing
                .rev
                .as_ref()
                .ok_or_else(|| StoreError::Invalid(format!("stored {} has no revision", doc.id)))?;
            Ok(base.next(&doc.body, doc.deleted))
        }
        // Re-creating a deleted document without knowing the tombstone's revision
        (Some(existing), None) if existing.deleted => {
            let base = existing
                .rev
                .as_ref()
                .ok_or_else(|| StoreError::Invalid(format!("stored {} has no revision", doc.id)))?;
            Ok(base.next(&doc.body, doc.deleted))
        }
        (current, supplied) => Err(StoreError::RevisionConflict {
            id: doc.id.clone(),
            expected: supplied.map(|r| r.to_string()),
            actual: current.and_then(|c| c.rev.as_ref()).map(|r| r.to_string()),
        }),
    }
}

#[derive(Default)]
struct StoreState {
    docs: HashMap<DocId, (Document, u64)>,
    /// seq -> id, holding only the latest seq of each document
    log: BTreeMap<u64, DocId>,
    update_seq: u64,
}

impl StoreState {
    fn record(&mut self, doc: Document) -> Change {
        self.update_seq += 1;
        let seq = self.update_seq;
        if let Some((_, old_seq)) = self.docs.get(&doc.id) {
            self.log.remove(old_seq);
        }
        self.log.insert(seq, doc.id.clone());
        self.docs.insert(doc.id.clone(), (doc.clone(), seq));
        Change {
            seq,
            id: doc.id.clone(),
            rev: doc.rev.clone().unwrap_or_else(|| Revision::new(0, "")),
            deleted: doc.deleted,
            doc,
        }
    }
}

/// In-memory document store for testing.
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    changes_tx: broadcast::Sender<Change>,
    /// When set, every operation fails with this error (simulates an outage).
    failure: RwLock<Option<StoreError>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            changes_tx,
            failure: RwLock::new(None),
        }
    }

    /// Make every subsequent operation fail with `error` (or recover with `None`).
    pub fn fail_with(&self, error: Option<StoreError>) {
        *self.failure.write().unwrap_or_else(|e| e.into_inner()) = error;
    }

    fn check_failure(&self) -> Result<()> {
        match &*self.failure.read().unwrap_or_else(|e| e.into_inner()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn write_doc(&self, mut doc: Document) -> Result<Revision> {
        let change = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let current = state.docs.get(&doc.id).map(|(d, _)| d);
            let rev = next_revision(current, &doc)?;
            doc.rev = Some(rev);
            state.record(doc)
        };
        let rev = change.rev.clone();
        // No receivers is fine
        let _ = self.changes_tx.send(change);
        Ok(rev)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, id: &str) -> Result<Document> {
        self.check_failure()?;
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .docs
            .get(id)
            .map(|(d, _)| d.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn put(&self, doc: Document) -> Result<Revision> {
        self.check_failure()?;
        self.write_doc(doc)
    }

    async fn force_put(&self, doc: Document) -> Result<()> {
        self.check_failure()?;
        if doc.rev.is_none() {
            return Err(StoreError::Invalid(format!(
                "replicated document {} has no revision",
                doc.id
            )));
        }
        let change = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if let Some((existing, _)) = state.docs.get(&doc.id) {
                if existing.rev == doc.rev {
                    return Ok(());
                }
            }
            state.record(doc)
        };
        let _ = self.changes_tx.send(change);
        Ok(())
    }

    async fn remove(&self, doc: &Document) -> Result<Revision> {
        self.check_failure()?;
        let mut tombstone = doc.clone();
        tombstone.deleted = true;
        tombstone.body.clear();
        self.write_doc(tombstone)
    }

    async fn changes(&self, since: u64) -> Result<Vec<Change>> {
        self.check_failure()?;
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let changes = state
            .log
            .range(since + 1..)
            .filter_map(|(seq, id)| {
                state.docs.get(id).map(|(doc, _)| Change {
                    seq: *seq,
                    id: id.clone(),
                    rev: doc.rev.clone().unwrap_or_else(|| Revision::new(0, "")),
                    deleted: doc.deleted,
                    doc: doc.clone(),
                })
            })
            .collect();
        Ok(changes)
    }

    fn watch(&self) -> broadcast::Receiver<Change> {
        self.changes_tx.subscribe()
    }

    async fn info(&self) -> Result<StoreInfo> {
        self.check_failure()?;
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(StoreInfo {
            document_count: state.docs.values().filter(|(d, _)| !d.deleted).count(),
            update_seq: state.update_seq,
        })
    }
}

// Implement DocumentStore for Arc<T> where T: DocumentStore
// This allows sharing one store between the orchestrator and the application
#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<T> {
    async fn get(&self, id: &str) -> Result<Document> {
        (**self).get(id).await
    }

    async fn put(&self, doc: Document) -> Result<Revision> {
        (**self).put(doc).await
    }

    async fn force_put(&self, doc: Document) -> Result<()> {
        (**self).force_put(doc).await
    }

    async fn remove(&self, doc: &Document) -> Result<Revision> {
        (**self).remove(doc).await
    }

    async fn changes(&self, since: u64) -> Result<Vec<Change>> {
        (**self).changes(since).await
    }

    fn watch(&self) -> broadcast::Receiver<Change> {
        (**self).watch()
    }

    async fn info(&self) -> Result<StoreInfo> {
        (**self).info().await
    }
}

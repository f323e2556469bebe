//! SyncLedger: what this process last saw as synced on both sides.
//!
//! For every document the ledger keeps the version that was identical on the
//! local and remote store after the last successful replication (the common
//! ancestor used by conflict detection), plus the change-feed checkpoints of
//! both stores. Persisted as the single state record `ledger`.

use crate::document::{DocId, Document, Revision};
use crate::state::{self, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State record key.
pub const LEDGER_KEY: &str = "ledger";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncLedger {
    bases: BTreeMap<DocId, Document>,
    /// Local update_seq already pushed.
    push_checkpoint: u64,
    /// Remote update_seq already pulled.
    pull_checkpoint: u64,
}

impl SyncLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from the state store, starting empty if there is no record yet.
    pub async fn load(state: &dyn StateStore) -> state::Result<Self> {
        Ok(state::load_record(state, LEDGER_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn save(&self, state: &dyn StateStore) -> state::Result<()> {
        state::save_record(state, LEDGER_KEY, self).await
    }

    /// Last synced version of `id`.
    pub fn base(&self, id: &str) -> Option<&Document> {
        self.bases.get(id)
    }

    pub fn base_rev(&self, id: &str) -> Option<&Revision> {
        self.bases.get(id).and_then(|d| d.rev.as_ref())
    }

    /// Record `doc` as identical on both sides.
    pub fn record(&mut self, doc: Document) {
        self.bases.insert(doc.id.clone(), doc);
    }

    pub fn forget(&mut self, id: &str) {
        self.bases.remove(id);
    }

    pub fn push_checkpoint(&self) -> u64 {
        self.push_checkpoint
    }

    pub fn pull_checkpoint(&self) -> u64 {
        self.pull_checkpoint
    }

    /// Checkpoints only move forward.
    pub fn advance_push(&mut self, seq: u64) {
        self.push_checkpoint = self.push_checkpoint.max(seq);
    }

    pub fn advance_pull(&mut self, seq: u64) {
        self.pull_checkpoint = self.pull_checkpoint.max(seq);
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }
}

//! Conflict detection and resolution.
//!
//! - `detector` - Decides whether a changed document diverged on both sides
//!   and whether the divergence can be merged without a human
//! - `resolver` - Produces and applies a [`Resolution`]

pub mod detector;
pub mod resolver;

pub use detector::ConflictDetector;
pub use resolver::ConflictResolver;

use crate::document::{DocId, Document};
use crate::state::{self, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Pending conflicts are kept as `conflicts/{doc_id}` records until resolved.
pub const CONFLICT_PREFIX: &str = "conflicts/";

/// Identifier of the conflict on a document: `"{doc_id}-conflict"`.
pub fn conflict_id(doc_id: &str) -> String {
    format!("{}-conflict", doc_id)
}

/// A document changed independently on both sides since the last sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub document_id: DocId,
    pub local: Document,
    pub remote: Document,
    /// Last version both sides agreed on, if known.
    pub base: Option<Document>,
    pub detected_at: u64,
    pub auto_resolvable: bool,
    /// Fields changed on either side relative to the base.
    pub changed_fields: BTreeSet<String>,
}

impl Conflict {
    fn key(document_id: &str) -> String {
        format!("{}{}", CONFLICT_PREFIX, document_id)
    }

    pub async fn save(&self, state: &dyn StateStore) -> state::Result<()> {
        state::save_record(state, &Self::key(&self.document_id), self).await
    }

    /// Drop the record for `document_id`. Missing records are fine.
    pub async fn forget(state: &dyn StateStore, document_id: &str) -> state::Result<()> {
        state.delete(&Self::key(document_id)).await
    }

    /// Every pending conflict, in key order.
    pub async fn load_all(state: &dyn StateStore) -> state::Result<Vec<Conflict>> {
        let mut conflicts = Vec::new();
        for key in state.keys(CONFLICT_PREFIX).await? {
            if let Some(conflict) = state::load_record::<Conflict>(state, &key).await? {
                conflicts.push(conflict);
            }
        }
        Ok(conflicts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    Merge,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionStrategy::LocalWins => "local-wins",
            ResolutionStrategy::RemoteWins => "remote-wins",
            ResolutionStrategy::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// The outcome chosen for one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: String,
    pub strategy: ResolutionStrategy,
    /// Content to write locally. Its `rev` is ignored; the current local
    /// revision is fetched right before the write.
    pub resolved_document: Document,
}

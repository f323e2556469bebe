//! Conflict resolver.
//!
//! `resolve` is pure: it picks the content for a conflict according to a
//! [`ResolutionStrategy`]. `apply` writes that content to the local store
//! using the revision fetched immediately before the write. If another writer
//! slips in between, the document is refetched once and the write retried;
//! a second revision conflict is returned to the caller.

use super::{Conflict, Resolution, ResolutionStrategy};
use crate::config::ConflictConfig;
use crate::document::{Body, Document, Revision};
use crate::error::{Result, SyncError};
use crate::store::{DocumentStore, StoreError};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    counter_fields: BTreeSet<String>,
}

impl ConflictResolver {
    pub fn new(config: &ConflictConfig) -> Self {
        Self {
            counter_fields: config.counter_fields.iter().cloned().collect(),
        }
    }

    /// Choose the content for `conflict`.
    ///
    /// `Merge` is only allowed for auto-resolvable conflicts.
    pub fn resolve(&self, conflict: &Conflict, strategy: ResolutionStrategy) -> Result<Resolution> {
        let (deleted, body) = match strategy {
            ResolutionStrategy::LocalWins => (conflict.local.deleted, conflict.local.body.clone()),
            ResolutionStrategy::RemoteWins => {
                (conflict.remote.deleted, conflict.remote.body.clone())
            }
            ResolutionStrategy::Merge => {
                if !conflict.auto_resolvable {
                    return Err(SyncError::NotAutoResolvable(conflict.id.clone()));
                }
                (
                    conflict.local.deleted && conflict.remote.deleted,
                    self.merge_bodies(conflict),
                )
            }
        };

        let mut resolved = Document::new(conflict.document_id.clone());
        resolved.deleted = deleted;
        resolved.body = if deleted { Body::new() } else { body };
        resolved.updated_at = conflict.local.updated_at.max(conflict.remote.updated_at);

        Ok(Resolution {
            conflict_id: conflict.id.clone(),
            strategy,
            resolved_document: resolved,
        })
    }

    /// Write a resolution to `store`, refetching once on a revision race.
    pub async fn apply(&self, resolution: &Resolution, store: &dyn DocumentStore) -> Result<Revision> {
        let id = &resolution.resolved_document.id;
        let mut refetched = false;

        loop {
            let current = match store.get(id).await {
                Ok(doc) => Some(doc),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };

            let mut doc = resolution.resolved_document.clone();
            doc.rev = current.and_then(|c| c.rev);

            let written = if doc.deleted {
                store.remove(&doc).await
            } else {
                store.put(doc).await
            };

            match written {
                Ok(rev) => {
                    debug!(
                        "Applied {} to {} at {}",
                        resolution.strategy, resolution.conflict_id, rev
                    );
                    return Ok(rev);
                }
                Err(StoreError::RevisionConflict { .. }) if !refetched => {
                    warn!(
                        "Local {} changed during write-back of {}, refetching",
                        id, resolution.conflict_id
                    );
                    refetched = true;
                }
                Err(StoreError::RevisionConflict { .. }) => {
                    return Err(SyncError::RevisionConflict { id: id.clone() });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remote as the starting point, local changes (relative to base) on top,
    /// counters take the larger value.
    fn merge_bodies(&self, conflict: &Conflict) -> Body {
        let local = &conflict.local;
        let remote = &conflict.remote;
        let mut merged = remote.body.clone();

        let local_changes = match &conflict.base {
            Some(base) => local.changed_fields(base),
            None => BTreeSet::new(),
        };
        for field in &local_changes {
            match local.field(field) {
                Some(value) => {
                    merged.insert(field.clone(), value.clone());
                }
                None => {
                    merged.remove(field);
                }
            }
        }

        for field in &self.counter_fields {
            if let (Some(Value::Number(l)), Some(Value::Number(r))) =
                (local.field(field), remote.field(field))
            {
                let larger = match (l.as_f64(), r.as_f64()) {
                    (Some(lf), Some(rf)) if rf > lf => r.clone(),
                    _ => l.clone(),
                };
                merged.insert(field.clone(), Value::Number(larger));
            }
        }

        merged
    }
}

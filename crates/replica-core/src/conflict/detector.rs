//! Conflict detector.
//!
//! Pure classification, never touches a store. Divergence means both the
//! local and the remote revision differ from the ledger's base and from each
//! other. A divergence is auto-resolvable when every field touched on both
//! sides either ended with the same value or is a monotonic counter.

use super::{conflict_id, Conflict};
use crate::config::ConflictConfig;
use crate::document::Document;
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    counter_fields: BTreeSet<String>,
}

impl ConflictDetector {
    pub fn new(config: &ConflictConfig) -> Self {
        Self {
            counter_fields: config.counter_fields.iter().cloned().collect(),
        }
    }

    /// Returns a conflict when `local` and `remote` diverged from `base`.
    pub fn detect(
        &self,
        local: &Document,
        remote: &Document,
        base: Option<&Document>,
        now_ms: u64,
    ) -> Option<Conflict> {
        let base_rev = base.and_then(|b| b.rev.as_ref());
        if local.rev == remote.rev {
            return None;
        }
        // One side unchanged: a fast-forward, not a conflict
        if base_rev.is_some() && (local.rev.as_ref() == base_rev || remote.rev.as_ref() == base_rev)
        {
            return None;
        }

        let (auto_resolvable, changed_fields) = self.classify(local, remote, base);
        Some(Conflict {
            id: conflict_id(&local.id),
            document_id: local.id.clone(),
            local: local.clone(),
            remote: remote.clone(),
            base: base.cloned(),
            detected_at: now_ms,
            auto_resolvable,
            changed_fields,
        })
    }

    pub fn is_counter(&self, field: &str) -> bool {
        self.counter_fields.contains(field)
    }

    fn classify(
        &self,
        local: &Document,
        remote: &Document,
        base: Option<&Document>,
    ) -> (bool, BTreeSet<String>) {
        let Some(base) = base else {
            return (local.same_content(remote), local.changed_fields(remote));
        };

        let local_changes = local.changed_fields(base);
        let remote_changes = remote.changed_fields(base);
        let changed: BTreeSet<String> = local_changes.union(&remote_changes).cloned().collect();

        if local.deleted || remote.deleted {
            // Delete vs edit always needs a human
            return (local.deleted && remote.deleted, changed);
        }

        let auto = local_changes
            .intersection(&remote_changes)
            .all(|field| self.overlap_mergeable(field, local, remote));
        (auto, changed)
    }

    fn overlap_mergeable(&self, field: &str, local: &Document, remote: &Document) -> bool {
        let (l, r) = (local.field(field), remote.field(field));
        if l == r {
            return true;
        }
        self.is_counter(field)
            && matches!((l, r), (Some(Value::Number(_)), Some(Value::Number(_))))
    }
}

//! Error taxonomy for the sync core.
//!
//! Every failure the core can produce is a [`SyncError`]. Each variant maps to
//! an [`ErrorCategory`], which is what the retry engine, circuit breaker, and
//! offline queue use to decide how to react:
//!
//! - `Transient`: retried by the retry engine, counted by the circuit breaker
//! - `RevisionConflict`: expected; drives conflict detection, never a sync failure
//! - `CircuitOpen`: sync deliberately refused; routed to the offline queue
//! - `Permanent`: dropped from the queue and reported once
//! - `Critical`: corruption/integrity signature; escalates to backup inspection
//! - `Control`: state-machine refusals (already syncing, throttled, paused, ...)

use crate::channel::ChannelError;
use crate::state::StateError;
use crate::store::StoreError;
use crate::transport::TransportError;
use serde::Serialize;
use thiserror::Error;

/// Broad classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Transient,
    RevisionConflict,
    CircuitOpen,
    Permanent,
    Critical,
    Control,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Revision conflict on {id}")]
    RevisionConflict { id: String },

    #[error("Sync refused: circuit open")]
    CircuitOpen,

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Critical failure: {0}")]
    Critical(String),

    #[error("Sync already in progress")]
    AlreadySyncing,

    #[error("Sync throttled, next manual sync allowed in {remaining_ms}ms")]
    Throttled { remaining_ms: u64 },

    #[error("Sync is paused")]
    Paused,

    #[error("Remote unavailable (offline)")]
    Offline,

    #[error("Sync core not initialized")]
    NotInitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("This process is not the session leader")]
    NotLeader,

    #[error("Conflict {0} is not auto-resolvable")]
    NotAutoResolvable(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{label} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        source: Box<SyncError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Message fragments that mark a failure as data corruption.
const CRITICAL_SIGNATURES: &[&str] = &["corrupt", "integrity", "data loss", "data-loss", "dataloss"];

/// Returns true when an error message carries a corruption/integrity signature.
pub fn has_critical_signature(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CRITICAL_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Transient(_) => ErrorCategory::Transient,
            SyncError::RevisionConflict { .. } => ErrorCategory::RevisionConflict,
            SyncError::CircuitOpen => ErrorCategory::CircuitOpen,
            SyncError::Permanent(_)
            | SyncError::Serialization(_)
            | SyncError::NotAutoResolvable(_) => ErrorCategory::Permanent,
            SyncError::Critical(_) => ErrorCategory::Critical,
            SyncError::RetriesExhausted { source, .. } => match source.category() {
                ErrorCategory::Critical => ErrorCategory::Critical,
                _ => ErrorCategory::Permanent,
            },
            SyncError::Store(e) => e.category(),
            SyncError::State(e) => e.category(),
            SyncError::Transport(e) => e.category(),
            SyncError::Channel(e) => e.category(),
            SyncError::AlreadySyncing
            | SyncError::Throttled { .. }
            | SyncError::Paused
            | SyncError::Offline
            | SyncError::NotInitialized
            | SyncError::NotFound(_)
            | SyncError::NotLeader
            | SyncError::ConflictNotFound(_)
            | SyncError::Cancelled => ErrorCategory::Control,
        }
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// True for the corruption family, either by variant or by message signature.
    pub fn is_critical(&self) -> bool {
        self.category() == ErrorCategory::Critical || has_critical_signature(&self.to_string())
    }

    /// Errors that mean "the remote can't be reached right now, keep the work for later".
    pub fn defers_work(&self) -> bool {
        matches!(
            self,
            SyncError::CircuitOpen | SyncError::Offline | SyncError::Paused
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(SyncError::Transient("timeout".into()).is_retryable());
        assert!(!SyncError::NotInitialized.is_retryable());
        assert!(!SyncError::NotFound("t1".into()).is_retryable());
        assert!(!SyncError::CircuitOpen.is_retryable());
        assert!(!SyncError::Permanent("bad doc".into()).is_retryable());
    }

    #[test]
    fn test_transport_errors_are_classified() {
        let err: SyncError = TransportError::Unreachable("remote".into()).into();
        assert_eq!(err.category(), ErrorCategory::Transient);

        let err: SyncError = TransportError::Rejected("schema".into()).into();
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_store_revision_conflict_category() {
        let err: SyncError = StoreError::RevisionConflict {
            id: "t1".into(),
            expected: None,
            actual: None,
        }
        .into();
        assert_eq!(err.category(), ErrorCategory::RevisionConflict);
    }

    #[test]
    fn test_critical_signature_detection() {
        assert!(has_critical_signature("Database CORRUPTED at page 4"));
        assert!(has_critical_signature("integrity check failed"));
        assert!(has_critical_signature("possible data loss"));
        assert!(!has_critical_signature("connection reset"));

        assert!(SyncError::Transient("store is corrupt".into()).is_critical());
        assert!(!SyncError::Transient("timeout".into()).is_critical());
    }

    #[test]
    fn test_exhausted_keeps_source_message() {
        let err = SyncError::RetriesExhausted {
            label: "push".into(),
            attempts: 3,
            source: Box::new(SyncError::Transient("timeout".into())),
        };
        assert_eq!(err.to_string(), "push failed after 3 attempt(s): Transient failure: timeout");
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }
}

//! replica-core: offline-first replication between a local document store and
//! a remote one.
//!
//! This crate provides:
//! - The sync orchestrator (push/pull cycles, conflict detection and
//!   resolution, circuit breaker, retries, health monitoring)
//! - A durable offline queue for work the remote can't take yet
//! - Cross-process coordination for processes of the same client: a shared
//!   message channel with batching and a session-owner election
//! - `DocumentStore`, `RemoteTransport` and `StateStore` trait abstractions,
//!   with in-memory implementations

pub mod backup;
pub mod batcher;
pub mod channel;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod document;
pub mod error;
pub mod events;
pub mod health;
pub mod hub;
pub mod leader;
pub mod ledger;
pub mod message;
pub mod metrics;
pub mod orchestrator;
pub mod origin;
pub mod queue;
pub mod retry;
pub mod state;
pub mod store;
pub mod transport;

pub use backup::{BackupInfo, BackupProvider, StaticBackupProvider};
pub use channel::{CrossTabChannel, InMemorySlot, SharedSlot};
pub use circuit::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SharedClock, system_clock};
pub use config::SyncConfig;
pub use conflict::{Conflict, ConflictDetector, ConflictResolver, Resolution, ResolutionStrategy};
pub use document::{Body, DocId, Document, Revision};
pub use error::{ErrorCategory, Result, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use hub::CoordinationHub;
pub use ledger::SyncLedger;
pub use message::{ChannelEvent, CrossTabMessage, IncomingEvent, LeaderState, SessionState};
pub use metrics::SyncMetrics;
pub use orchestrator::{CycleReport, StateReloader, Submission, SyncHealth, SyncOrchestrator, SyncStatus};
pub use origin::OriginId;
pub use queue::{Operation, OperationExecutor, Priority};
pub use state::{InMemoryStateStore, StateStore};
pub use store::{DocumentStore, InMemoryStore, StoreError};
pub use transport::{RemoteTransport, StoreTransport};

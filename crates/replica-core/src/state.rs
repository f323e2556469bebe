//! Durable state records (offline queue entries, metrics, sync ledger).
//!
//! Records are JSON values addressed by string keys:
//! - `queue/{operation_id}` - one record per queued operation
//! - `metrics` - the sync counters
//! - `ledger` - last-synced revisions and replication checkpoints
//!
//! Implementations:
//! - `InMemoryStateStore` - For testing (survives a simulated restart when shared)
//! - `JsonStateStore` (in replica-daemon) - One JSON file per key on disk

use crate::error::ErrorCategory;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StateError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StateError::Serialization(_) => ErrorCategory::Permanent,
            StateError::Io(_) => ErrorCategory::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Key-value persistence for the core's own bookkeeping.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    async fn save(&self, key: &str, value: Value) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Load and deserialize a typed record.
pub async fn load_record<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    match store.load(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StateError::Serialization(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

/// Serialize and save a typed record.
pub async fn save_record<T: Serialize>(store: &dyn StateStore, key: &str, record: &T) -> Result<()> {
    let value =
        serde_json::to_value(record).map_err(|e| StateError::Serialization(e.to_string()))?;
    store.save(key, value).await
}

/// In-memory state store for testing.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(key).cloned())
    }

    async fn save(&self, key: &str, value: Value) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for std::sync::Arc<T> {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        (**self).load(key).await
    }

    async fn save(&self, key: &str, value: Value) -> Result<()> {
        (**self).save(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys(prefix).await
    }
}

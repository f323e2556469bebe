//! Backup snapshots consulted when a sync fails with a corruption signature.
//!
//! The backup mechanism itself lives outside the core; the orchestrator only
//! asks for the most recent snapshot so it can tell the operator how old it is.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Where the snapshot lives (path, URL, ...).
    pub location: String,
    /// Snapshot time, milliseconds since Unix epoch.
    pub created_at: u64,
    pub document_count: usize,
}

impl BackupInfo {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at)
    }
}

#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// Most recent snapshot, if any exists.
    async fn latest_backup(&self) -> Option<BackupInfo>;
}

/// Fixed answer, for tests and for daemons without a backup directory.
#[derive(Default)]
pub struct StaticBackupProvider {
    latest: RwLock<Option<BackupInfo>>,
}

impl StaticBackupProvider {
    pub fn new(latest: Option<BackupInfo>) -> Self {
        Self {
            latest: RwLock::new(latest),
        }
    }

    pub fn set(&self, latest: Option<BackupInfo>) {
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = latest;
    }
}

#[async_trait]
impl BackupProvider for StaticBackupProvider {
    async fn latest_backup(&self) -> Option<BackupInfo> {
        self.latest.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Human-readable age, e.g. "12 minutes".
pub fn describe_age(age_ms: u64) -> String {
    let minutes = age_ms / 60_000;
    match minutes {
        0 => "less than a minute".to_string(),
        1 => "1 minute".to_string(),
        m if m < 120 => format!("{} minutes", m),
        m => format!("{} hours", m / 60),
    }
}

//! On-disk state records for the sync core.
//!
//! Each key is one pretty-printed JSON file under the state directory:
//! `ledger` → `ledger.json`, `queue/{id}` → `queue/{id}.json`. The offline
//! queue, the sync ledger and the metrics therefore survive a restart.

use async_trait::async_trait;
use replica_core::state::{Result, StateError, StateStore};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const EXTENSION: &str = "json";

fn io_error(path: &Path, e: std::io::Error) -> StateError {
    StateError::Io(format!("{}: {}", path.display(), e))
}

/// Storage for state records.
pub struct JsonStateStore {
    root: PathBuf,
}

impl JsonStateStore {
    /// Create storage in `root` (created if missing).
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid {
            return Err(StateError::Io(format!("invalid state key {:?}", key)));
        }
        Ok(self.root.join(format!("{}.{}", key, EXTENSION)))
    }

    /// Every key under `dir`, relative to the root.
    async fn collect_keys(&self, dir: PathBuf, out: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir, e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| io_error(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    continue;
                }
                let Ok(relative) = path.with_extension("").strip_prefix(&self.root).map(Path::to_path_buf) else {
                    continue;
                };
                let key: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(key.join("/"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| StateError::Serialization(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn save(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let contents = serde_json::to_string_pretty(&value)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).await.map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| io_error(&path, e))?;
        debug!("Saved state record {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(self.root.clone(), &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_writes_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::open(temp_dir.path()).await.unwrap();

        store.save("metrics", json!({"totalSyncs": 3})).await.unwrap();

        let file = temp_dir.path().join("metrics.json");
        assert!(file.exists());
        let contents = std::fs::read_to_string(&file).unwrap();
        let loaded: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(loaded, json!({"totalSyncs": 3}));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = JsonStateStore::open(temp_dir.path()).await.unwrap();
            store.save("ledger", json!({"pushCheckpoint": 7})).await.unwrap();
            store.save("queue/op-1", json!({"id": "op-1"})).await.unwrap();
        }

        let store = JsonStateStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(
            store.load("ledger").await.unwrap(),
            Some(json!({"pushCheckpoint": 7}))
        );
        assert_eq!(store.keys("queue/").await.unwrap(), vec!["queue/op-1"]);
    }

    #[tokio::test]
    async fn test_keys_filter_by_prefix_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::open(temp_dir.path()).await.unwrap();
        for key in ["queue/b", "queue/a", "metrics", "ledger"] {
            store.save(key, json!(null)).await.unwrap();
        }

        assert_eq!(store.keys("queue/").await.unwrap(), vec!["queue/a", "queue/b"]);
        assert_eq!(store.keys("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::open(temp_dir.path()).await.unwrap();

        store.save("queue/a", json!(1)).await.unwrap();
        store.delete("queue/a").await.unwrap();
        store.delete("queue/a").await.unwrap();
        assert_eq!(store.load("queue/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_path_escape() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::open(temp_dir.path()).await.unwrap();
        assert!(store.save("../outside", json!(1)).await.is_err());
        assert!(store.load("").await.is_err());
    }

    #[tokio::test]
    async fn test_unreadable_record_is_serialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::open(temp_dir.path()).await.unwrap();
        std::fs::write(temp_dir.path().join("ledger.json"), "{oops").unwrap();

        assert!(matches!(
            store.load("ledger").await,
            Err(StateError::Serialization(_))
        ));
    }
}

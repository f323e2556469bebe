//! Directory-backed document store using tokio::fs.
//!
//! Layout under the root directory:
//! - `docs/{encoded id}.json` - one record `{seq, doc}` per document
//!   (tombstones included)
//! - `meta.json` - `{updateSeq}`
//! - `.lock` - advisory lock held around every write
//!
//! Nothing is cached: every read goes to disk, so two processes pointing at
//! the same directory (e.g. a shared remote) see each other's writes. Writes
//! are serialized within a process by a mutex and across processes by an
//! exclusive lock on `.lock`, so sequence numbers stay unique. Records land
//! via write-then-rename.

use async_trait::async_trait;
use fs2::FileExt;
use replica_core::document::{Document, Revision};
use replica_core::store::{next_revision, Change, DocumentStore, Result, StoreError, StoreInfo};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

const WATCH_CAPACITY: usize = 256;
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDoc {
    seq: u64,
    doc: Document,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    update_seq: u64,
}

/// Keep `[A-Za-z0-9._-]`, percent-encode every other byte.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && !out.is_empty()) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {}", path.display(), e))
}

/// Write `contents` next to `path` and rename it into place.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).await.map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))
}

/// Exclusive lock on the store directory, released on drop.
struct DirLock(File);

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            debug!("Failed to unlock store directory: {}", e);
        }
    }
}

pub struct DirStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    changes_tx: broadcast::Sender<Change>,
}

impl DirStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("docs")).await?;
        let (changes_tx, _) = broadcast::channel(WATCH_CAPACITY);
        debug!("Opened document store at {:?}", root);
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            changes_tx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.root.join("docs").join(format!("{}.json", encode_id(id)))
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    /// Take the cross-process write lock, waiting for other writers.
    async fn lock_dir(&self) -> Result<DirLock> {
        let path = self.root.join(LOCK_FILE);
        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| StoreError::Io(format!("{}: {}", path.display(), e)))?
        .map_err(|e| io_error(&path, e))?;
        Ok(DirLock(file))
    }

    async fn read_meta(&self) -> Result<Meta> {
        let path = self.meta_path();
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Meta::default()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn read_stored(&self, path: &Path) -> Result<Option<StoredDoc>> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn read_all(&self) -> Result<Vec<StoredDoc>> {
        let dir = self.root.join("docs");
        let mut entries = fs::read_dir(&dir).await.map_err(|e| io_error(&dir, e))?;
        let mut docs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stored) = self.read_stored(&path).await? {
                docs.push(stored);
            }
        }
        docs.sort_by_key(|s| s.seq);
        Ok(docs)
    }

    /// Persist `doc` under the next sequence number. Caller holds both write locks.
    async fn record(&self, doc: Document) -> Result<Change> {
        let mut meta = self.read_meta().await?;
        meta.update_seq += 1;
        let stored = StoredDoc {
            seq: meta.update_seq,
            doc,
        };

        let bytes = serde_json::to_vec_pretty(&stored)
            .map_err(|e| StoreError::Invalid(format!("{}: {}", stored.doc.id, e)))?;
        write_atomic(&self.doc_path(&stored.doc.id), &bytes).await?;
        let meta_bytes =
            serde_json::to_vec(&meta).map_err(|e| StoreError::Invalid(e.to_string()))?;
        write_atomic(&self.meta_path(), &meta_bytes).await?;

        let change = Change {
            seq: stored.seq,
            id: stored.doc.id.clone(),
            rev: stored.doc.rev.clone().unwrap_or_else(|| Revision::new(0, "")),
            deleted: stored.doc.deleted,
            doc: stored.doc,
        };
        // No watchers is fine
        let _ = self.changes_tx.send(change.clone());
        Ok(change)
    }

    async fn write_doc(&self, mut doc: Document) -> Result<Revision> {
        let _guard = self.write_lock.lock().await;
        let _dir = self.lock_dir().await?;
        let current = self.read_stored(&self.doc_path(&doc.id)).await?;
        let rev = next_revision(current.as_ref().map(|s| &s.doc), &doc)?;
        doc.rev = Some(rev.clone());
        self.record(doc).await?;
        Ok(rev)
    }
}

#[async_trait]
impl DocumentStore for DirStore {
    async fn get(&self, id: &str) -> Result<Document> {
        self.read_stored(&self.doc_path(id))
            .await?
            .map(|s| s.doc)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn put(&self, doc: Document) -> Result<Revision> {
        self.write_doc(doc).await
    }

    async fn force_put(&self, doc: Document) -> Result<()> {
        if doc.rev.is_none() {
            return Err(StoreError::Invalid(format!(
                "replicated document {} has no revision",
                doc.id
            )));
        }
        let _guard = self.write_lock.lock().await;
        let _dir = self.lock_dir().await?;
        if let Some(existing) = self.read_stored(&self.doc_path(&doc.id)).await? {
            if existing.doc.rev == doc.rev {
                return Ok(());
            }
        }
        self.record(doc).await?;
        Ok(())
    }

    async fn remove(&self, doc: &Document) -> Result<Revision> {
        let mut tombstone = doc.clone();
        tombstone.deleted = true;
        tombstone.body.clear();
        self.write_doc(tombstone).await
    }

    async fn changes(&self, since: u64) -> Result<Vec<Change>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|s| s.seq > since)
            .map(|s| Change {
                seq: s.seq,
                id: s.doc.id.clone(),
                rev: s.doc.rev.clone().unwrap_or_else(|| Revision::new(0, "")),
                deleted: s.doc.deleted,
                doc: s.doc,
            })
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<Change> {
        self.changes_tx.subscribe()
    }

    async fn info(&self) -> Result<StoreInfo> {
        let meta = self.read_meta().await?;
        let document_count = self.read_all().await?.iter().filter(|s| !s.doc.deleted).count();
        Ok(StoreInfo {
            document_count,
            update_seq: meta.update_seq,
        })
    }
}

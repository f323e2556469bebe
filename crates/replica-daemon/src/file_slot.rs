//! Shared slot backed by a directory every process of the client can see.
//!
//! Each `write` drops one message file `{millis}-{owner}-{n}.msg` into the
//! directory (written as `.tmp`, then renamed). A notify-debouncer-mini
//! watcher reads message files it has not seen yet and publishes their
//! contents on the slot's feed. Files that existed before `open` are never
//! replayed.
//!
//! `clear` expires every message file older than the retention window, so a
//! slow watcher still gets to read a message before it disappears, and files
//! left behind by processes that have exited are collected too.

use anyhow::Result;
use async_trait::async_trait;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use replica_core::channel::{self, ChannelError, SharedSlot};
use replica_core::origin::OriginId;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

const FEED_CAPACITY: usize = 256;
const MESSAGE_EXTENSION: &str = "msg";

/// Message files kept around for readers before `clear` removes them.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(20);

type SeenFiles = Arc<Mutex<HashSet<String>>>;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn message_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(&format!(".{}", MESSAGE_EXTENSION)))
        .collect();
    // Names start with the zero-padded write time
    names.sort();
    names
}

/// `(written_at, owner)` from a message file name.
fn parse_name(name: &str) -> Option<(u64, &str)> {
    let stem = name.strip_suffix(&format!(".{}", MESSAGE_EXTENSION))?;
    let mut parts = stem.splitn(3, '-');
    let millis = parts.next()?.parse().ok()?;
    let owner = parts.next()?;
    Some((millis, owner))
}

/// Publish every message file not seen before.
fn scan(dir: &Path, seen: &SeenFiles, tx: &broadcast::Sender<String>) {
    let names = message_names(dir);
    let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
    for name in &names {
        if seen.contains(name) {
            continue;
        }
        match std::fs::read_to_string(dir.join(name)) {
            Ok(contents) => {
                seen.insert(name.clone());
                if !contents.is_empty() {
                    // No watchers is fine
                    let _ = tx.send(contents);
                }
            }
            // Expired between listing and reading
            Err(e) => debug!("Failed to read slot message {}: {}", name, e),
        }
    }
    let present: HashSet<&String> = names.iter().collect();
    seen.retain(|name| present.contains(name));
}

pub struct FileSlot {
    dir: PathBuf,
    owner: String,
    counter: AtomicU64,
    retention: Duration,
    tx: broadcast::Sender<String>,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl FileSlot {
    pub fn open(dir: PathBuf, owner: OriginId) -> Result<Self> {
        Self::with_timing(dir, owner, DEFAULT_DEBOUNCE, DEFAULT_RETENTION)
    }

    pub fn with_timing(
        dir: PathBuf,
        owner: OriginId,
        debounce: Duration,
        retention: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        // FSEvents needs the real path (macOS /var -> /private/var)
        let dir = dir.canonicalize().unwrap_or(dir);

        let seen: SeenFiles = Arc::new(Mutex::new(message_names(&dir).into_iter().collect()));
        let (tx, _) = broadcast::channel(FEED_CAPACITY);

        let watch_dir = dir.clone();
        let watch_seen = Arc::clone(&seen);
        let watch_tx = tx.clone();
        let mut debouncer = new_debouncer(
            debounce,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let relevant = events.iter().any(|event| {
                        event.path.extension().and_then(|e| e.to_str()) == Some(MESSAGE_EXTENSION)
                    });
                    if relevant {
                        scan(&watch_dir, &watch_seen, &watch_tx);
                    }
                }
                Err(e) => {
                    error!("Shared slot watcher error: {}", e);
                }
            },
        )?;
        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)?;

        debug!("Shared slot {} watching {:?}", owner, dir);
        Ok(Self {
            dir,
            owner: owner.to_string(),
            counter: AtomicU64::new(0),
            retention,
            tx,
            _debouncer: debouncer,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SharedSlot for FileSlot {
    async fn write(&self, value: String) -> channel::Result<()> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{:013}-{}-{}.{}", now_millis(), self.owner, n, MESSAGE_EXTENSION);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let path = self.dir.join(&name);

        fs::write(&tmp, value.as_bytes())
            .await
            .map_err(|e| ChannelError::Slot(format!("{}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| ChannelError::Slot(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn clear(&self) -> channel::Result<()> {
        let cutoff = now_millis().saturating_sub(self.retention.as_millis() as u64);
        for name in message_names(&self.dir) {
            let Some((written_at, _)) = parse_name(&name) else {
                continue;
            };
            if written_at >= cutoff {
                continue;
            }
            match fs::remove_file(self.dir.join(&name)).await {
                Ok(()) => {}
                // Another process expired it first
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to expire slot message {}: {}", name, e),
            }
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

//! Durable stores the router depends on but does not own: the pending-update log and the
//! webhook registration store.
//!
//! Stores serialize their own writes; callers share them by `Arc`.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::token::ShardKey;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt store {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("store is closed")]
    Closed,
}

/// Completion of an asynchronous store close.
pub type CloseCompletion = oneshot::Sender<Result<(), StoreError>>;

/// Result of one garbage-collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOutcome {
    pub deleted: u64,
    /// `false` when the pass stopped early and more expired entries likely remain.
    pub finished: bool,
}

/// Log of updates waiting to be delivered, partitioned by [`ShardKey`].
pub trait UpdateLog: Send + Sync {
    /// Appends an update that expires at unix time `expires_at`; returns its id.
    fn append(
        &self,
        shard: ShardKey,
        expires_at: i64,
        payload: serde_json::Value,
    ) -> Result<u64, StoreError>;

    fn pending_count(&self, shard: ShardKey) -> u64;

    /// Deletes entries that expired at or before unix time `cutoff`.
    fn run_gc(&self, cutoff: i64) -> GcOutcome;

    fn close(&self, completion: CloseCompletion);
}

/// Key/value store of persisted webhook registrations.
pub trait WebhookStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_all(&self) -> Vec<(String, String)>;

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn erase(&self, key: &str) -> Result<(), StoreError>;

    fn close(&self, completion: CloseCompletion);
}

#[derive(Debug)]
struct LogEntry {
    id: u64,
    expires_at: i64,
    payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct LogInner {
    shards: BTreeMap<ShardKey, VecDeque<LogEntry>>,
    next_id: u64,
    closed: bool,
}

/// In-memory [`UpdateLog`] with a bounded amount of work per GC pass.
#[derive(Debug)]
pub struct MemoryUpdateLog {
    gc_batch: usize,
    inner: Mutex<LogInner>,
}

impl MemoryUpdateLog {
    pub const DEFAULT_GC_BATCH: usize = 10_000;

    pub fn new() -> Self {
        Self::with_gc_batch(Self::DEFAULT_GC_BATCH)
    }

    pub fn with_gc_batch(gc_batch: usize) -> Self {
        Self {
            gc_batch: gc_batch.max(1),
            inner: Mutex::new(LogInner {
                next_id: 1,
                ..LogInner::default()
            }),
        }
    }

    /// Payloads pending for `shard`, oldest first.
    pub fn pending_updates(&self, shard: ShardKey) -> Vec<(u64, serde_json::Value)> {
        let inner = self.inner.lock();
        inner.shards.get(&shard).map_or_else(Vec::new, |queue| {
            queue
                .iter()
                .map(|entry| (entry.id, entry.payload.clone()))
                .collect()
        })
    }

    /// Ids of the oldest and newest pending entries for `shard`.
    pub fn watermarks(&self, shard: ShardKey) -> Option<(u64, u64)> {
        let inner = self.inner.lock();
        let queue = inner.shards.get(&shard)?;
        Some((queue.front()?.id, queue.back()?.id))
    }
}

impl Default for MemoryUpdateLog {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateLog for MemoryUpdateLog {
    fn append(
        &self,
        shard: ShardKey,
        expires_at: i64,
        payload: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.shards.entry(shard).or_default().push_back(LogEntry {
            id,
            expires_at,
            payload,
        });
        Ok(id)
    }

    fn pending_count(&self, shard: ShardKey) -> u64 {
        let inner = self.inner.lock();
        inner.shards.get(&shard).map_or(0, |queue| queue.len() as u64)
    }

    fn run_gc(&self, cutoff: i64) -> GcOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return GcOutcome {
                deleted: 0,
                finished: true,
            };
        }

        let budget = self.gc_batch;
        let mut deleted = 0usize;
        let mut finished = true;
        for queue in inner.shards.values_mut() {
            queue.retain(|entry| {
                if entry.expires_at > cutoff {
                    return true;
                }
                if deleted < budget {
                    deleted += 1;
                    false
                } else {
                    finished = false;
                    true
                }
            });
        }
        inner.shards.retain(|_, queue| !queue.is_empty());

        GcOutcome {
            deleted: deleted as u64,
            finished,
        }
    }

    fn close(&self, completion: CloseCompletion) {
        self.inner.lock().closed = true;
        let _ = completion.send(Ok(()));
    }
}

/// In-memory [`WebhookStore`].
#[derive(Debug, Default)]
pub struct MemoryWebhookStore {
    inner: Mutex<KvInner>,
}

#[derive(Debug, Default)]
struct KvInner {
    entries: BTreeMap<String, String>,
    closed: bool,
}

impl MemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            inner: Mutex::new(KvInner {
                entries: entries
                    .into_iter()
                    .map(|(key, value)| (key.into(), value.into()))
                    .collect(),
                closed: false,
            }),
        }
    }
}

impl WebhookStore for MemoryWebhookStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    fn get_all(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn erase(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.entries.remove(key);
        Ok(())
    }

    fn close(&self, completion: CloseCompletion) {
        self.inner.lock().closed = true;
        let _ = completion.send(Ok(()));
    }
}

/// [`WebhookStore`] persisted as a JSON object in a single file.
///
/// Every mutation rewrites the file through a temporary file in the same directory, so a crash
/// leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileWebhookStore {
    path: PathBuf,
    inner: Mutex<KvInner>,
}

impl FileWebhookStore {
    pub const FILE_NAME: &'static str = "webhooks.json";

    /// Opens (or creates) the store in `working_dir`.
    pub fn open(working_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(working_dir).map_err(|source| StoreError::Io {
            path: working_dir.display().to_string(),
            source,
        })?;
        let path = working_dir.join(Self::FILE_NAME);
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => {
                serde_json::from_str(&text).map_err(|err| StoreError::Corrupt {
                    path: path.display().to_string(),
                    message: err.to_string(),
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Ok(Self {
            path,
            inner: Mutex::new(KvInner {
                entries,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        let bytes = serde_json::to_vec_pretty(entries).map_err(|err| StoreError::Corrupt {
            path: self.path.display().to_string(),
            message: err.to_string(),
        })?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|err| io_err(err.error))?;
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let mut entries = inner.entries.clone();
        f(&mut entries);
        self.persist(&entries)?;
        inner.entries = entries;
        Ok(())
    }
}

impl WebhookStore for FileWebhookStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    fn get_all(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.mutate(|entries| {
            entries.insert(key.to_owned(), value.to_owned());
        })
    }

    fn erase(&self, key: &str) -> Result<(), StoreError> {
        self.mutate(|entries| {
            entries.remove(key);
        })
    }

    fn close(&self, completion: CloseCompletion) {
        let mut inner = self.inner.lock();
        if inner.closed {
            let _ = completion.send(Ok(()));
            return;
        }
        inner.closed = true;
        let result = self.persist(&inner.entries);
        let _ = completion.send(result);
    }
}

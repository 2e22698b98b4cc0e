//! The persistent offline queue.
//!
//! Everything the pipeline could not deliver immediately lands here:
//! priority-tagged items partitioned by kind, capped by total size. When the
//! cap is exceeded the oldest items in the lowest non-empty priority band
//! are evicted first, so a flood of bulk telemetry can never push out a
//! critical error.
//!
//! The queue is backed by an embedded sqlite database; if that cannot be
//! opened the store falls back to memory only, warns once, and reports
//! itself degraded. The store also persists the two pieces of long-lived
//! agent state, the device id and the last-sync marker.

mod memory;
mod sqlite;

use std::path::PathBuf;
use std::sync::Mutex;

use revi::common::now_millis;
use revi::error::AgentResult;
use revi::event::{EventKind, Priority};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use self::memory::MemoryBackend;
use self::sqlite::SqliteBackend;

/// Default total-size cap.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
/// Cap applied while degraded to memory-only operation.
pub const DEGRADED_MAX_BYTES: u64 = 2 * 1024 * 1024;
/// Meta key holding the persistent device id.
pub const DEVICE_ID_KEY: &str = "revi_device_id";
/// Meta key holding the last successful sync, ms since epoch.
pub const LAST_SYNC_KEY: &str = "revi_last_sync";
/// File name of the embedded database.
pub const DB_FILE_NAME: &str = "revi_offline.db";

/// One queued payload awaiting delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredItem {
    /// Stable item id.
    pub id: String,
    /// Partition tag.
    pub kind: EventKind,
    /// Enqueue time, ms since epoch.
    pub created_at: u64,
    /// Failed submission attempts so far.
    pub retry_count: u32,
    /// Upload priority.
    pub priority: Priority,
    /// Approximate serialized size.
    pub size_bytes: u64,
    /// The payload itself.
    pub payload: serde_json::Value,
}

/// Storage operations the queue needs from a backend.
pub(crate) trait StoreBackend: Send + std::fmt::Debug {
    fn insert(&mut self, item: &StoredItem) -> AgentResult<()>;
    fn remove(&mut self, id: &str) -> AgentResult<()>;
    fn update_retry(&mut self, id: &str, retry_count: u32) -> AgentResult<()>;
    fn load_all(&mut self) -> AgentResult<Vec<StoredItem>>;
    fn get_meta(&mut self, key: &str) -> AgentResult<Option<String>>;
    fn set_meta(&mut self, key: &str, value: &str) -> AgentResult<()>;
}

/// Offline store configuration.
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    /// Directory for the embedded database. `None` keeps the queue in
    /// memory.
    pub directory: Option<PathBuf>,
    /// Total-size cap; `None` uses [`DEFAULT_MAX_BYTES`].
    pub max_bytes: Option<u64>,
}

#[derive(Debug)]
struct StoreInner {
    backend: Box<dyn StoreBackend>,
    items: Vec<StoredItem>,
    total_bytes: u64,
    degraded: bool,
}

/// Priority-ordered, size-capped persistent queue.
///
/// Writes go through a single lock: one writer at a time per item, reads
/// consistent with the latest committed write.
#[derive(Debug)]
pub struct OfflineStore {
    inner: Mutex<StoreInner>,
    max_bytes: u64,
}

impl OfflineStore {
    /// Open the store. Never fails: a broken backing store degrades to
    /// memory-only operation with a reduced cap and a single warning.
    pub fn open(config: StoreConfig) -> Self {
        let (backend, degraded): (Box<dyn StoreBackend>, bool) = match &config.directory {
            Some(directory) => match SqliteBackend::open(directory) {
                Ok(backend) => (Box::new(backend), false),
                Err(err) => {
                    warn!(error = %err, "offline store unavailable, falling back to memory");
                    (Box::new(MemoryBackend::new()), true)
                }
            },
            None => (Box::new(MemoryBackend::new()), true),
        };

        let mut backend = backend;
        let items = backend.load_all().unwrap_or_default();
        let total_bytes = items.iter().map(|item| item.size_bytes).sum();
        let max_bytes = config.max_bytes.unwrap_or(if degraded {
            DEGRADED_MAX_BYTES
        } else {
            DEFAULT_MAX_BYTES
        });

        OfflineStore {
            inner: Mutex::new(StoreInner {
                backend,
                items,
                total_bytes,
                degraded,
            }),
            max_bytes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a payload. Returns the stored item's id.
    pub fn enqueue(&self, kind: EventKind, priority: Priority, payload: serde_json::Value) -> String {
        let size_bytes = payload.to_string().len() as u64;
        let item = StoredItem {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            created_at: now_millis(),
            retry_count: 0,
            priority,
            size_bytes,
            payload,
        };

        let mut inner = self.lock();
        if let Err(err) = inner.backend.insert(&item) {
            debug!(error = %err, "offline store insert not persisted");
        }
        inner.total_bytes += item.size_bytes;
        let id = item.id.clone();
        inner.items.push(item);
        self.evict_over_cap(&mut inner);
        id
    }

    // Oldest items of the lowest non-empty priority band go first.
    fn evict_over_cap(&self, inner: &mut StoreInner) {
        while inner.total_bytes > self.max_bytes {
            let Some(lowest) = inner.items.iter().map(|item| item.priority).max() else {
                break;
            };
            let Some(victim_index) = inner
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.priority == lowest)
                .min_by_key(|(_, item)| item.created_at)
                .map(|(index, _)| index)
            else {
                break;
            };
            let victim = inner.items.remove(victim_index);
            inner.total_bytes = inner.total_bytes.saturating_sub(victim.size_bytes);
            if let Err(err) = inner.backend.remove(&victim.id) {
                debug!(error = %err, "offline store eviction not persisted");
            }
            debug!(id = %victim.id, priority = victim.priority.as_str(), "evicted over size cap");
        }
    }

    /// Remove items after successful submission (or terminal rejection).
    pub fn remove(&self, ids: &[String]) {
        let mut inner = self.lock();
        for id in ids {
            if let Some(index) = inner.items.iter().position(|item| item.id == *id) {
                let item = inner.items.remove(index);
                inner.total_bytes = inner.total_bytes.saturating_sub(item.size_bytes);
            }
            if let Err(err) = inner.backend.remove(id) {
                debug!(error = %err, "offline store removal not persisted");
            }
        }
    }

    /// Bump the retry counter of items whose submission failed.
    pub fn bump_retry(&self, ids: &[String]) {
        let mut inner = self.lock();
        for id in ids {
            let Some(index) = inner.items.iter().position(|item| item.id == *id) else {
                continue;
            };
            inner.items[index].retry_count += 1;
            let retry_count = inner.items[index].retry_count;
            if let Err(err) = inner.backend.update_retry(id, retry_count) {
                debug!(error = %err, "offline store retry bump not persisted");
            }
        }
    }

    /// Items of one kind, priority-then-timestamp ordered.
    pub fn items_by_kind(&self, kind: EventKind) -> Vec<StoredItem> {
        let mut items: Vec<StoredItem> = self
            .lock()
            .items
            .iter()
            .filter(|item| item.kind == kind)
            .cloned()
            .collect();
        sort_for_upload(&mut items);
        items
    }

    /// Items of one priority, oldest first.
    pub fn items_by_priority(&self, priority: Priority) -> Vec<StoredItem> {
        let mut items: Vec<StoredItem> = self
            .lock()
            .items
            .iter()
            .filter(|item| item.priority == priority)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        items
    }

    /// Every queued item, priority-then-timestamp ordered.
    pub fn all_items(&self) -> Vec<StoredItem> {
        let mut items = self.lock().items.clone();
        sort_for_upload(&mut items);
        items
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Total size of queued payloads.
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    /// Whether the store is running without its persistent backend.
    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    /// The persistent device id, generated on first use.
    pub fn device_id(&self) -> String {
        let mut inner = self.lock();
        if let Ok(Some(existing)) = inner.backend.get_meta(DEVICE_ID_KEY) {
            return existing;
        }
        let fresh = uuid::Uuid::new_v4().to_string();
        if let Err(err) = inner.backend.set_meta(DEVICE_ID_KEY, &fresh) {
            debug!(error = %err, "device id not persisted");
        }
        fresh
    }

    /// The last successful sync, ms since epoch; 0 when never synced.
    pub fn last_sync(&self) -> u64 {
        self.lock()
            .backend
            .get_meta(LAST_SYNC_KEY)
            .ok()
            .flatten()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Persist a new last-sync marker.
    pub fn set_last_sync(&self, timestamp: u64) {
        if let Err(err) = self
            .lock()
            .backend
            .set_meta(LAST_SYNC_KEY, &timestamp.to_string())
        {
            debug!(error = %err, "last-sync marker not persisted");
        }
    }
}

fn sort_for_upload(items: &mut [StoredItem]) {
    items.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
}

//! In-process fallback store
//!
//! Positive entries live in an LRU-bounded Moka cache; negative results live in
//! a second Moka cache so that caching "nothing found" never evicts real
//! values. Expiry is checked lazily on read against a per-entry deadline, which
//! lets callers pick a TTL per write. The store keeps its own tag index so tag
//! invalidation is as precise here as it is on the remote backend.
//!
//! In shard mode the store is constructed disabled: every read is a miss and
//! every write is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::Tag;

/// A cached lookup result. `Negative` means the source legitimately returned
/// nothing, which is different from the key being absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    Value(T),
    Negative,
}

struct LocalEntry<V> {
    value: Arc<V>,
    expires_at: Instant,
}

impl<V> Clone for LocalEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            expires_at: self.expires_at,
        }
    }
}

/// Bounded, TTL-aware local cache of decoded values
pub struct LocalStore<V: Send + Sync + 'static> {
    enabled: bool,
    max_entries: u64,
    entries: Cache<String, LocalEntry<V>>,
    negatives: Cache<String, Instant>,
    /// tag -> keys; may hold keys that were already evicted
    tag_index: Mutex<HashMap<Tag, HashSet<String>>>,
    /// Writes since construction; the index is swept every `max_entries` writes
    writes: AtomicU64,
}

impl<V: Send + Sync + 'static> std::fmt::Debug for LocalStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("enabled", &self.enabled)
            .field("max_entries", &self.max_entries)
            .field("entry_count", &self.entries.entry_count())
            .field("negative_count", &self.negatives.entry_count())
            .finish()
    }
}

impl<V: Send + Sync + 'static> LocalStore<V> {
    pub fn new(max_entries: u64) -> Self {
        Self {
            enabled: true,
            max_entries,
            entries: Cache::builder()
                .max_capacity(max_entries)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            negatives: Cache::builder()
                .max_capacity(max_entries)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            tag_index: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// A store that never holds anything (shard mode)
    pub fn disabled() -> Self {
        let mut store = Self::new(1);
        store.enabled = false;
        store
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn get(&self, key: &str) -> Option<Cached<Arc<V>>> {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();

        if let Some(expires_at) = self.negatives.get(key).await {
            if expires_at > now {
                debug!("Local negative hit for key: {}", key);
                return Some(Cached::Negative);
            }
            self.negatives.invalidate(key).await;
        }

        if let Some(entry) = self.entries.get(key).await {
            if entry.expires_at > now {
                debug!("Local hit for key: {}", key);
                return Some(Cached::Value(entry.value));
            }
            debug!("Local entry expired for key: {}", key);
            self.entries.invalidate(key).await;
        }

        None
    }

    /// Store a positive (`Some`) or negative (`None`) result.
    pub async fn set(&self, key: &str, value: Option<Arc<V>>, ttl: Duration, tags: &[Tag]) {
        if !self.enabled {
            return;
        }
        let expires_at = Instant::now() + ttl;
        match value {
            Some(value) => {
                self.negatives.invalidate(key).await;
                self.entries
                    .insert(key.to_owned(), LocalEntry { value, expires_at })
                    .await;
            }
            None => {
                self.entries.invalidate(key).await;
                self.negatives.insert(key.to_owned(), expires_at).await;
            }
        }
        self.index(key, tags);
    }

    fn index(&self, key: &str, tags: &[Tag]) {
        let mut index = self.tag_index.lock();
        for tag in tags {
            index.entry(tag.clone()).or_default().insert(key.to_owned());
        }

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.max_entries.max(1) == 0 {
            // Drop references to keys that were evicted from both caches
            index.retain(|_, keys| {
                keys.retain(|k| {
                    self.entries.contains_key(k.as_str()) || self.negatives.contains_key(k.as_str())
                });
                !keys.is_empty()
            });
        }
    }

    pub async fn delete(&self, key: &str) {
        if !self.enabled {
            return;
        }
        self.entries.invalidate(key).await;
        self.negatives.invalidate(key).await;
    }

    /// Remove every entry whose key starts with `prefix`. Returns the number removed.
    pub async fn clear_by_prefix(&self, prefix: &str) -> u64 {
        if !self.enabled {
            return 0;
        }
        let mut doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.as_ref().clone())
            .collect();
        doomed.extend(
            self.negatives
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.as_ref().clone()),
        );

        for key in &doomed {
            self.delete(key).await;
        }
        self.tag_index.lock().retain(|_, keys| {
            keys.retain(|k| !k.starts_with(prefix));
            !keys.is_empty()
        });

        debug!("Local clear by prefix {} removed {} entries", prefix, doomed.len());
        doomed.len() as u64
    }

    /// Remove every entry written with any of `tags`. Returns the number of keys touched.
    pub async fn invalidate_tags(&self, tags: &[Tag]) -> u64 {
        if !self.enabled {
            return 0;
        }
        let keys: HashSet<String> = {
            let mut index = self.tag_index.lock();
            tags.iter()
                .filter_map(|tag| index.remove(tag))
                .flatten()
                .collect()
        };
        for key in &keys {
            self.delete(key).await;
        }
        keys.len() as u64
    }

    /// Number of live positive plus negative entries.
    pub async fn len(&self) -> u64 {
        if !self.enabled {
            return 0;
        }
        self.entries.run_pending_tasks().await;
        self.negatives.run_pending_tasks().await;
        self.entries.entry_count() + self.negatives.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.negatives.invalidate_all();
        self.tag_index.lock().clear();
    }
}

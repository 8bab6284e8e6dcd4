//! In-process fast tier with TTL expiry and LRU eviction

use crate::error::{CacheError, Result};
use crate::tier::{FastTier, TierKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Counters for the in-process tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryTierStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub size_bytes: usize,
    /// Evictions due to entry or byte limits
    pub evictions_size: u64,
    /// Evictions due to TTL expiration
    pub evictions_ttl: u64,
}

struct StoredValue {
    value: String,
    expires_at: DateTime<Utc>,
    size_bytes: usize,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

struct Store {
    entries: HashMap<String, StoredValue>,
    /// Access order, least recently used at the front
    lru_queue: VecDeque<String>,
    stats: MemoryTierStats,
    current_size_bytes: usize,
}

/// Volatile key/value tier living in the current process
///
/// Thread-safe via an async `RwLock`. Entries past their TTL are dropped on
/// read; when the entry or byte limit is hit the least recently used keys go
/// first.
pub struct MemoryFastTier {
    max_entries: usize,
    max_size_bytes: usize,
    store: RwLock<Store>,
}

impl MemoryFastTier {
    pub fn new(max_entries: usize, max_size_bytes: usize) -> Self {
        info!(
            "Initializing in-process fast tier (max_entries: {}, max_size_bytes: {})",
            max_entries, max_size_bytes
        );

        Self {
            max_entries,
            max_size_bytes,
            store: RwLock::new(Store {
                entries: HashMap::new(),
                lru_queue: VecDeque::new(),
                stats: MemoryTierStats::default(),
                current_size_bytes: 0,
            }),
        }
    }

    /// Drop all expired entries, returning how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        let mut store = self.store.write().await;
        let now = Utc::now();

        let expired: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, v)| v.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            Self::remove_entry(&mut store, key);
        }
        store.stats.evictions_ttl += expired.len() as u64;

        if !expired.is_empty() {
            debug!("Cleaned up {} expired fast tier entries", expired.len());
        }
        expired.len()
    }

    pub async fn stats(&self) -> MemoryTierStats {
        let store = self.store.read().await;
        let mut stats = store.stats.clone();
        stats.entries = store.entries.len();
        stats.size_bytes = store.current_size_bytes;
        stats
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }

    pub async fn clear(&self) {
        let mut store = self.store.write().await;
        let count = store.entries.len();
        store.entries.clear();
        store.lru_queue.clear();
        store.current_size_bytes = 0;
        info!("Cleared {} entries from fast tier", count);
    }

    fn remove_entry(store: &mut Store, key: &str) {
        if let Some(entry) = store.entries.remove(key) {
            store.lru_queue.retain(|k| k != key);
            store.current_size_bytes = store.current_size_bytes.saturating_sub(entry.size_bytes);
        }
    }

    fn touch(store: &mut Store, key: &str) {
        store.lru_queue.retain(|k| k != key);
        store.lru_queue.push_back(key.to_string());
    }

    fn evict_if_needed(&self, store: &mut Store, needed_size: usize) -> Result<()> {
        while store.entries.len() >= self.max_entries {
            match store.lru_queue.pop_front() {
                Some(key) => {
                    debug!("Evicting fast tier entry due to max_entries limit: {}", key);
                    Self::remove_entry(store, &key);
                    store.stats.evictions_size += 1;
                }
                None => break,
            }
        }

        while store.current_size_bytes + needed_size > self.max_size_bytes {
            match store.lru_queue.pop_front() {
                Some(key) => {
                    debug!("Evicting fast tier entry due to size limit: {}", key);
                    Self::remove_entry(store, &key);
                    store.stats.evictions_size += 1;
                }
                None => {
                    warn!("Cannot evict more entries, fast tier size limit exceeded");
                    return Err(CacheError::unavailable(
                        TierKind::Fast,
                        format!("value of {} bytes exceeds fast tier capacity", needed_size),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl Default for MemoryFastTier {
    fn default() -> Self {
        Self::new(10_000, 64 * 1024 * 1024)
    }
}

#[async_trait]
impl FastTier for MemoryFastTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut store = self.store.write().await;
        let now = Utc::now();

        let expired = match store.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                store.stats.misses += 1;
                return Ok(None);
            }
        };

        if expired {
            debug!("Fast tier entry expired: {}", key);
            Self::remove_entry(&mut store, key);
            store.stats.misses += 1;
            store.stats.evictions_ttl += 1;
            return Ok(None);
        }

        let value = store.entries.get(key).map(|e| e.value.clone());
        Self::touch(&mut store, key);
        store.stats.hits += 1;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let size_bytes = key.len() + value.len();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));

        let mut store = self.store.write().await;

        // Replacing a key must not count the old value against the limits
        Self::remove_entry(&mut store, key);
        self.evict_if_needed(&mut store, size_bytes)?;

        store.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at,
                size_bytes,
            },
        );
        store.lru_queue.push_back(key.to_string());
        store.current_size_bytes += size_bytes;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut store = self.store.write().await;
        Self::remove_entry(&mut store, key);
        Ok(())
    }
}

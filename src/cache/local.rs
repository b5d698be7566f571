//! Local Cache - Process-Local Tier
//!
//! Bounded in-process cache shared by every session of a registry (and used
//! as the request-scoped data loader).
//!
//! # Design
//!
//! - ShardedMap for minimal lock contention between keys
//! - Bounded by entry count; least-recently-used entries are evicted in
//!   batches once the bound is reached
//! - A global access tick instead of wall clock time orders recency

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::domain::ports::CacheTier;
use crate::error::Result;

use super::entry::{CachedValue, LocalEntry};
use super::shard::ShardedMap;
use super::{DEFAULT_LOCAL_CAPACITY, LOCAL_SHARD_COUNT};

/// Local cache configuration
#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Entries evicted per eviction pass (at least one)
    pub eviction_batch_size: usize,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOCAL_CAPACITY)
    }
}

impl LocalCacheConfig {
    /// Configuration for a given capacity, evicting a tenth per pass
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            eviction_batch_size: (capacity / 10).max(1),
        }
    }
}

/// Process-local cache tier
pub struct LocalCache {
    pool: String,
    storage: ShardedMap<String, Arc<LocalEntry>>,
    config: LocalCacheConfig,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LocalCache {
    /// Create a local cache with default configuration
    pub fn new(pool: impl Into<String>) -> Self {
        Self::with_config(pool, LocalCacheConfig::default())
    }

    /// Create a local cache bounded to `capacity` entries
    pub fn with_capacity(pool: impl Into<String>, capacity: usize) -> Self {
        Self::with_config(pool, LocalCacheConfig::with_capacity(capacity))
    }

    /// Create a local cache with custom configuration
    pub fn with_config(pool: impl Into<String>, config: LocalCacheConfig) -> Self {
        Self {
            pool: pool.into(),
            storage: ShardedMap::new(LOCAL_SHARD_COUNT),
            config,
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up an entry, recording the access
    fn lookup(&self, key: &str) -> Option<Arc<LocalEntry>> {
        match self.storage.get(key) {
            Some(entry) => {
                entry.touch(self.next_tick());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Get a text value synchronously
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.lookup(key).and_then(|e| e.text().map(str::to_string))
    }

    /// Store a value, evicting first when the bound is reached
    pub fn put(&self, key: String, value: CachedValue) {
        if self.storage.get(&key).is_none() && self.len() >= self.config.capacity {
            self.evict();
        }
        let entry = Arc::new(LocalEntry::new(value, self.next_tick()));
        self.storage.insert(key, entry);
    }

    /// Merge fields into a hash entry, replacing a text entry of the same key
    pub fn put_fields(&self, key: &str, fields: Vec<(String, String)>) {
        let tick = self.next_tick();
        let mut pending = Some(fields);
        self.storage.update(key, |entry| {
            let merged = match entry.value() {
                CachedValue::Hash(existing) => {
                    let mut merged = existing.clone();
                    merged.extend(pending.take().into_iter().flatten());
                    merged
                }
                CachedValue::Text(_) => pending.take().into_iter().flatten().collect(),
            };
            *entry = Arc::new(LocalEntry::new(CachedValue::Hash(merged), tick));
        });
        if let Some(fields) = pending {
            self.put(key.to_string(), CachedValue::Hash(fields.into_iter().collect()));
        }
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> bool {
        self.storage.remove(key).is_some()
    }

    /// Check for a key without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.storage.get(key).is_some()
    }

    /// Evict the least recently used batch of entries
    fn evict(&self) {
        let mut candidates: Vec<(String, u64)> = self
            .storage
            .shards()
            .flat_map(|shard| shard.entries())
            .map(|(key, entry)| (key, entry.last_access()))
            .collect();
        candidates.sort_by_key(|(_, tick)| *tick);

        let batch = self.config.eviction_batch_size.max(1);
        let mut evicted = 0;
        for (key, _) in candidates.into_iter().take(batch) {
            if self.storage.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        trace!(pool = %self.pool, evicted, "local cache eviction");
    }

    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit ratio in `0.0..=1.0`
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Remove every entry
    pub fn purge(&self) {
        self.storage.clear();
    }

    /// Get cache statistics
    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            entries: self.len(),
            capacity: self.capacity(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
        }
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("pool", &self.pool)
            .field("entries", &self.len())
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

/// Local cache statistics
#[derive(Debug, Clone)]
pub struct LocalCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
}

#[async_trait]
impl CacheTier for LocalCache {
    fn pool(&self) -> &str {
        &self.pool
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_text(key))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        Ok(keys.iter().map(|k| self.get_text(k)).collect())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.put(key.to_string(), CachedValue::Text(value));
        Ok(())
    }

    async fn multi_set(&self, entries: Vec<(String, String)>) -> Result<()> {
        for (key, value) in entries {
            self.put(key, CachedValue::Text(value));
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        Ok(match self.lookup(key) {
            Some(entry) => fields
                .iter()
                .map(|f| entry.field(f).map(str::to_string))
                .collect(),
            None => vec![None; fields.len()],
        })
    }

    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<()> {
        self.put_fields(key, fields);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.purge();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_and_miss() {
        let cache = LocalCache::new("default");
        assert_eq!(cache.get("a:1").await.unwrap(), None);
        cache.set("a:1", "[\"Tom\"]".into()).await.unwrap();
        assert_eq!(cache.get("a:1").await.unwrap().as_deref(), Some("[\"Tom\"]"));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hit_ratio(), 0.5);
    }

    #[tokio::test]
    async fn test_multi_get_alignment() {
        let cache = LocalCache::new("default");
        cache
            .multi_set(vec![("a:1".into(), "x".into()), ("a:3".into(), "nil".into())])
            .await
            .unwrap();
        let values = cache
            .multi_get(&["a:1".into(), "a:2".into(), "a:3".into()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("x".into()), None, Some("nil".into())]);
    }

    #[tokio::test]
    async fn test_hash_fields_merge() {
        let cache = LocalCache::new("default");
        cache
            .hash_set("s", vec![("1".into(), "3 1 2 3".into())])
            .await
            .unwrap();
        cache
            .hash_set("s", vec![("2".into(), "3".into())])
            .await
            .unwrap();
        let values = cache
            .hash_get("s", &["1".into(), "2".into(), "3".into()])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Some("3 1 2 3".into()), Some("3".into()), None]
        );
        // text reads of a hash key miss
        assert_eq!(cache.get("s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = LocalCache::with_capacity("default", 3);
        cache.set("k1", "1".into()).await.unwrap();
        cache.set("k2", "2".into()).await.unwrap();
        cache.set("k3", "3".into()).await.unwrap();

        // k1 becomes most recently used
        cache.get("k1").await.unwrap();
        cache.set("k4", "4".into()).await.unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.contains("k1"));
        assert!(!cache.contains("k2"));
        assert!(cache.contains("k4"));
        assert_eq!(cache.evictions(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = LocalCache::with_capacity("default", 2);
        cache.set("k1", "1".into()).await.unwrap();
        cache.set("k2", "2".into()).await.unwrap();
        cache.set("k2", "22".into()).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = LocalCache::new("default");
        cache.set("k1", "1".into()).await.unwrap();
        cache.set("k2", "2".into()).await.unwrap();
        cache.delete(&["k1".into()]).await.unwrap();
        assert!(!cache.contains("k1"));
        cache.clear().await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().entries, 0);
    }
}

//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two shards, each behind its own
//! `RwLock`, so readers of different keys never contend.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Single shard containing a hashmap and statistics
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of entries in this shard
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Check if the shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    /// Get a value from the shard
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(key).cloned()
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.map.write().insert(key, value)
    }

    /// Remove a value, returning it if present
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.map.write().remove(key)
    }

    /// Update a value in place, returning whether it existed
    pub fn update<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V),
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        match self.map.write().get_mut(key) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let guard = self.map.read();
        guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Sharded map with a power-of-two shard count
pub struct ShardedMap<K, V> {
    shards: Vec<Shard<K, V>>,
    mask: usize,
}

impl<K, V> ShardedMap<K, V> {
    /// Create a map with at least `shard_count` shards (rounded up to a power of two)
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..count).map(|_| Shard::new()).collect(),
            mask: count - 1,
        }
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.read_count()).sum()
    }

    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.write_count()).sum()
    }

    /// Iterate over shards
    pub fn shards(&self) -> impl Iterator<Item = &Shard<K, V>> {
        self.shards.iter()
    }
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    #[inline]
    fn shard_for<Q: Hash + ?Sized>(&self, key: &Q) -> &Shard<K, V> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.mask]
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).remove(key)
    }

    pub fn update<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V),
    {
        self.shard_for(key).update(key, f)
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_insert_get_remove() {
        let shard: Shard<String, i32> = Shard::new();
        assert!(shard.is_empty());

        assert!(shard.insert("key1".to_string(), 42).is_none());
        assert_eq!(shard.get("key1"), Some(42));
        assert_eq!(shard.remove("key1"), Some(42));
        assert!(shard.is_empty());
        assert_eq!(shard.write_count(), 2);
        assert_eq!(shard.read_count(), 1);
    }

    #[test]
    fn test_shard_count_rounds_up() {
        let map: ShardedMap<String, i32> = ShardedMap::new(10);
        assert_eq!(map.shard_count(), 16);
        let map: ShardedMap<String, i32> = ShardedMap::new(0);
        assert_eq!(map.shard_count(), 1);
    }

    #[test]
    fn test_sharded_map_update_and_clear() {
        let map: ShardedMap<String, i32> = ShardedMap::new(16);
        for i in 0..100 {
            map.insert(format!("key{}", i), i);
        }
        assert_eq!(map.len(), 100);

        assert!(map.update("key1", |v| *v += 10));
        assert_eq!(map.get("key1"), Some(11));
        assert!(!map.update("missing", |v| *v += 10));

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_sharded_map_distribution() {
        let map: ShardedMap<String, i32> = ShardedMap::new(16);
        for i in 0..1000 {
            map.insert(format!("key{}", i), i);
        }
        let max = map.shards().map(|s| s.len()).max().unwrap_or(0);
        assert!(max < 200, "uneven distribution: {}", max);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<String, i32>> = Arc::new(ShardedMap::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let key = format!("key-{}-{}", t, i);
                        map.insert(key.clone(), i);
                        map.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 8000);
    }
}

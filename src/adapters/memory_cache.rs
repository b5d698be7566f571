//! In-Memory Shared Cache
//!
//! Stand-in for a remote shared cache (string keys, plain and hash values).
//! Used by tests and the demo; counts every operation so tests can assert on
//! round trips.
//!
//! # Design
//!
//! - DashMap for lock-free concurrent access instead of a single RwLock
//! - Operation counters per command family
//! - Failure injection to exercise backend error propagation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::cache::CachedValue;
use crate::domain::ports::CacheTier;
use crate::error::{Error, Result};

/// In-memory shared cache tier
pub struct MemorySharedCache {
    pool: String,
    storage: DashMap<String, CachedValue>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failing: AtomicBool,
}

impl MemorySharedCache {
    /// Create an empty cache for a pool
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            storage: DashMap::new(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every following operation fail until switched off
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::cache(&self.pool, "connection refused"))
        } else {
            Ok(())
        }
    }

    /// Plain value of a key, without counting a read
    pub fn peek(&self, key: &str) -> Option<String> {
        self.storage.get(key).and_then(|v| match v.value() {
            CachedValue::Text(s) => Some(s.clone()),
            CachedValue::Hash(_) => None,
        })
    }

    /// Whether a key exists, without counting a read
    pub fn contains(&self, key: &str) -> bool {
        self.storage.contains_key(key)
    }

    /// Keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.storage.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Read commands served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Write commands served
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Delete commands served
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Reset the operation counters
    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MemorySharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySharedCache")
            .field("pool", &self.pool)
            .field("entries", &self.storage.len())
            .finish()
    }
}

#[async_trait]
impl CacheTier for MemorySharedCache {
    fn pool(&self) -> &str {
        &self.pool
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.peek(key))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(keys.iter().map(|k| self.peek(k)).collect())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.storage.insert(key.to_string(), CachedValue::Text(value));
        Ok(())
    }

    async fn multi_set(&self, entries: Vec<(String, String)>) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        for (key, value) in entries {
            self.storage.insert(key, CachedValue::Text(value));
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let entry = self.storage.get(key);
        Ok(fields
            .iter()
            .map(|field| match entry.as_deref() {
                Some(CachedValue::Hash(values)) => values.get(field).cloned(),
                _ => None,
            })
            .collect())
    }

    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut entry = self
            .storage
            .entry(key.to_string())
            .or_insert_with(|| CachedValue::Hash(HashMap::new()));
        if matches!(entry.value(), CachedValue::Text(_)) {
            *entry = CachedValue::Hash(HashMap::new());
        }
        if let CachedValue::Hash(values) = entry.value_mut() {
            values.extend(fields);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.check()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        for key in keys {
            self.storage.remove(key);
        }
        trace!(pool = %self.pool, count = keys.len(), "Deleted shared cache keys");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        self.storage.clear();
        Ok(())
    }
}

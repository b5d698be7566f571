//! Engine Metrics Collection
//!
//! Counters for cache tier traffic, storage round trips and invalidation
//! activity, shared by every session of a registry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine metrics collector
#[derive(Debug, Default)]
pub struct EngineMetrics {
    // Local tier
    local_hits: AtomicU64,
    local_misses: AtomicU64,

    // Shared tier
    shared_hits: AtomicU64,
    shared_misses: AtomicU64,

    // Storage
    storage_queries: AtomicU64,
    storage_statements: AtomicU64,

    // Cache writes
    cache_sets: AtomicU64,
    cache_deletes: AtomicU64,

    // Search
    search_shard_hits: AtomicU64,
    search_shard_misses: AtomicU64,

    // Flush side effects
    invalidations: AtomicU64,
    events_published: AtomicU64,
}

impl EngineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Local tier
    pub fn record_local_hits(&self, n: u64) {
        self.local_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_local_misses(&self, n: u64) {
        self.local_misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn local_hits(&self) -> u64 {
        self.local_hits.load(Ordering::Relaxed)
    }

    pub fn local_misses(&self) -> u64 {
        self.local_misses.load(Ordering::Relaxed)
    }

    // Shared tier
    pub fn record_shared_hits(&self, n: u64) {
        self.shared_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_shared_misses(&self, n: u64) {
        self.shared_misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn shared_hits(&self) -> u64 {
        self.shared_hits.load(Ordering::Relaxed)
    }

    pub fn shared_misses(&self) -> u64 {
        self.shared_misses.load(Ordering::Relaxed)
    }

    // Storage
    pub fn record_query(&self) {
        self.storage_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_statements(&self, n: u64) {
        self.storage_statements.fetch_add(n, Ordering::Relaxed);
    }

    pub fn storage_queries(&self) -> u64 {
        self.storage_queries.load(Ordering::Relaxed)
    }

    pub fn storage_statements(&self) -> u64 {
        self.storage_statements.load(Ordering::Relaxed)
    }

    // Cache writes
    pub fn record_cache_sets(&self, n: u64) {
        self.cache_sets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_cache_deletes(&self, n: u64) {
        self.cache_deletes.fetch_add(n, Ordering::Relaxed);
    }

    // Search shards
    pub fn record_shard_hits(&self, n: u64) {
        self.search_shard_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_shard_misses(&self, n: u64) {
        self.search_shard_misses.fetch_add(n, Ordering::Relaxed);
    }

    // Flush side effects
    pub fn record_invalidations(&self, n: u64) {
        self.invalidations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_events(&self, n: u64) {
        self.events_published.fetch_add(n, Ordering::Relaxed);
    }

    /// Share of point lookups answered by either cache tier
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits = self.local_hits() + self.shared_hits();
        let total = hits + self.storage_lookups();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    // Lookups that fell through every configured tier
    fn storage_lookups(&self) -> u64 {
        let local = self.local_misses();
        let shared = self.shared_misses();
        if shared > 0 {
            shared
        } else {
            local
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            local_hits: self.local_hits(),
            local_misses: self.local_misses(),
            shared_hits: self.shared_hits(),
            shared_misses: self.shared_misses(),
            storage_queries: self.storage_queries(),
            storage_statements: self.storage_statements(),
            cache_sets: self.cache_sets.load(Ordering::Relaxed),
            cache_deletes: self.cache_deletes.load(Ordering::Relaxed),
            search_shard_hits: self.search_shard_hits.load(Ordering::Relaxed),
            search_shard_misses: self.search_shard_misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.local_hits,
            &self.local_misses,
            &self.shared_hits,
            &self.shared_misses,
            &self.storage_queries,
            &self.storage_statements,
            &self.cache_sets,
            &self.cache_deletes,
            &self.search_shard_hits,
            &self.search_shard_misses,
            &self.invalidations,
            &self.events_published,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all engine metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub local_hits: u64,
    pub local_misses: u64,
    pub shared_hits: u64,
    pub shared_misses: u64,
    pub storage_queries: u64,
    pub storage_statements: u64,
    pub cache_sets: u64,
    pub cache_deletes: u64,
    pub search_shard_hits: u64,
    pub search_shard_misses: u64,
    pub invalidations: u64,
    pub events_published: u64,
    pub overall_hit_ratio: f64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "local hits/misses:   {}/{}", self.local_hits, self.local_misses)?;
        writeln!(f, "shared hits/misses:  {}/{}", self.shared_hits, self.shared_misses)?;
        writeln!(f, "storage queries:     {}", self.storage_queries)?;
        writeln!(f, "storage statements:  {}", self.storage_statements)?;
        writeln!(f, "cache sets/deletes:  {}/{}", self.cache_sets, self.cache_deletes)?;
        writeln!(
            f,
            "search shards hit/miss: {}/{}",
            self.search_shard_hits, self.search_shard_misses
        )?;
        writeln!(f, "invalidations:       {}", self.invalidations)?;
        writeln!(f, "events published:    {}", self.events_published)?;
        write!(f, "overall hit ratio:   {:.2}", self.overall_hit_ratio)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.local_hits(), 0);
        assert_eq!(metrics.storage_queries(), 0);
        assert_eq!(metrics.overall_hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = EngineMetrics::new();
        // two lookups answered locally, one by the shared tier, one by storage
        metrics.record_local_hits(2);
        metrics.record_local_misses(2);
        metrics.record_shared_hits(1);
        metrics.record_shared_misses(1);
        assert!((metrics.overall_hit_ratio() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = EngineMetrics::new();
        metrics.record_query();
        metrics.record_statements(3);
        metrics.record_invalidations(2);
        metrics.record_events(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.storage_queries, 1);
        assert_eq!(snapshot.storage_statements, 3);
        assert_eq!(snapshot.invalidations, 2);
        assert_eq!(snapshot.events_published, 1);
        assert!(snapshot.to_string().contains("storage statements:  3"));

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}

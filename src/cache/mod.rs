//! Cache Tiers
//!
//! Process-local tier, key derivation, value codec and engine metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Resolver / Cached Search                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Local tier (in process)  │ Shared tier (remote) │ Storage    │
//! │  ┌────────────────────┐   │ ┌────────────────┐   │ ┌────────┐ │
//! │  │ ShardedMap + LRU   │   │ │ CacheTier port │   │ │ SELECT │ │
//! │  └────────────────────┘   │ └────────────────┘   │ └────────┘ │
//! │         miss ─────────────────▶ miss ──────────────▶          │
//! │         ◀──────── back-fill only the tiers that missed ───────│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Space
//!
//! - `<prefix>:<id>` holds a JSON row or the `"nil"` sentinel
//! - `<prefix>_<index>_<params hash>` is a hash of 1000-ID shards

pub mod codec;
mod entry;
pub mod key;
mod local;
mod metrics;
mod shard;

pub use entry::{CachedValue, LocalEntry};
pub use local::{LocalCache, LocalCacheConfig, LocalCacheStats};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use shard::{Shard, ShardedMap};

/// Number of shards of the local tier
pub const LOCAL_SHARD_COUNT: usize = 64;

/// Default local tier capacity in entries
pub const DEFAULT_LOCAL_CAPACITY: usize = 100_000;

/// Number of IDs per cached search shard
pub const SEARCH_SHARD_SIZE: usize = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_power_of_two() {
        assert!(LOCAL_SHARD_COUNT.is_power_of_two());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(SEARCH_SHARD_SIZE, 1000);
        assert_eq!(LocalCacheConfig::default().capacity, DEFAULT_LOCAL_CAPACITY);
    }
}

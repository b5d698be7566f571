//! Property-Based Tests for the Read Path
//!
//! # Test Properties
//!
//! 1. **Shard Coverage**: the shard span of a window covers it exactly
//! 2. **Rounding Stability**: rounding a float twice equals rounding once
//! 3. **Pagination Stability**: every page size yields the same ID sequence

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::{search_ids, shard_span, Pager, ReadContext};
use crate::adapters::{MemorySharedCache, MemoryStorage};
use crate::cache::{LocalCache, SEARCH_SHARD_SIZE};
use crate::domain::ports::Storage;
use crate::entity::testing::user_schema;
use crate::schema::{round_float, round_significant, Registry};
use crate::sql::Statement;
use crate::value::Value;

// =============================================================================
// Property Strategies
// =============================================================================

/// Window `[start, end)` with `end > start`
fn window_strategy() -> impl Strategy<Value = (usize, usize)> {
    (0usize..20_000, 1usize..5_000).prop_map(|(start, len)| (start, start + len))
}

fn registry_with_rows(rows: usize) -> (Arc<Registry>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new("default"));
    let registry = Registry::builder()
        .storage(storage.clone())
        .local_cache(Arc::new(LocalCache::new("default")))
        .shared_cache(Arc::new(MemorySharedCache::new("default")))
        .entity(user_schema())
        .validate()
        .unwrap();
    if rows > 0 {
        let statement = Statement::Insert {
            table: "User".into(),
            columns: vec!["Name".into(), "Age".into(), "Friend".into(), "FakeDelete".into()],
            rows: (0..rows)
                .map(|i| vec![format!("u{}", i).into(), Value::Int(10), Value::Null, Value::UInt(0)])
                .collect(),
            on_duplicate_update: None,
        };
        tokio_test::block_on(storage.exec(&statement)).unwrap();
    }
    (registry, storage)
}

fn all_pages(registry: &Registry, size: usize) -> (Vec<u64>, usize) {
    let ctx = ReadContext {
        registry,
        loader: None,
        transactions: None,
    };
    let schema = Arc::clone(registry.schema("User").unwrap());
    let mut ids = Vec::new();
    let mut pager = Pager::first(size);
    loop {
        let (page, total) = tokio_test::block_on(search_ids(
            ctx,
            &schema,
            "IndexAge",
            &pager,
            &[Value::Int(10)],
        ))
        .unwrap();
        ids.extend(&page);
        if page.len() < size || ids.len() >= total {
            return (ids, total);
        }
        pager = pager.next();
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_shard_span_covers_window((start, end) in window_strategy()) {
        let (first, last) = shard_span(start, end);
        prop_assert!(first <= last);
        prop_assert!(first * SEARCH_SHARD_SIZE <= start);
        prop_assert!(start < (first + 1) * SEARCH_SHARD_SIZE);
        prop_assert!(end <= (last + 1) * SEARCH_SHARD_SIZE);
        prop_assert!(end > last * SEARCH_SHARD_SIZE);
    }

    #[test]
    fn prop_round_float_is_stable(value in -1.0e9f64..1.0e9, decimals in 0u32..=16) {
        let once = round_float(value, decimals);
        prop_assert_eq!(round_float(once, decimals), once);
    }

    #[test]
    fn prop_round_significant_is_stable(value in -1.0e12f64..1.0e12, digits in 1u32..=15) {
        let once = round_significant(value, digits);
        prop_assert_eq!(round_significant(once, digits), once);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_pagination_is_stable(rows in 0usize..2_600, a in 1usize..900, b in 1usize..900) {
        let (registry, _storage) = registry_with_rows(rows);
        let expected: Vec<u64> = (1..=rows as u64).collect();

        let (by_a, total_a) = all_pages(&registry, a);
        prop_assert_eq!(total_a, rows);
        prop_assert_eq!(&by_a, &expected);

        // Second pass reads shards cached by the first
        let (by_b, total_b) = all_pages(&registry, b);
        prop_assert_eq!(total_b, rows);
        prop_assert_eq!(&by_b, &expected);
    }
}

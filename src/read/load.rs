//! Point-lookup resolver

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{instrument, trace};

use crate::cache::codec::{decode_row, encode_row};
use crate::domain::ports::{CacheTier, NIL};
use crate::entity::{materialize, Entity};
use crate::error::Result;
use crate::schema::EntitySchema;
use crate::sql::{Filter, Query, Row, Select};
use crate::value::Value;

use super::{warm_up, ReadContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TierKind {
    Local,
    Shared,
    Loader,
}

/// Tiers consulted for point keys, nearest first
fn point_tiers(ctx: ReadContext<'_>, schema: &EntitySchema) -> Vec<(TierKind, Arc<dyn CacheTier>)> {
    if let Some(loader) = ctx.loader {
        let tier: Arc<dyn CacheTier> = loader.clone();
        return vec![(TierKind::Loader, tier)];
    }
    let mut tiers = Vec::with_capacity(2);
    if let Some(tier) = ctx.registry.local_tier(schema) {
        tiers.push((TierKind::Local, Arc::clone(tier)));
    }
    if let Some(tier) = ctx.registry.shared_tier(schema) {
        tiers.push((TierKind::Shared, Arc::clone(tier)));
    }
    tiers
}

/// Resolve rows by ID through the cache tiers and storage.
///
/// The result holds the rows that exist; confirmed-absent and missing IDs
/// are left out. With `use_cache` the tiers are read first and every tier
/// that missed a key is back-filled with the row or the negative sentinel.
pub(crate) async fn fetch_rows(
    ctx: ReadContext<'_>,
    schema: &Arc<EntitySchema>,
    ids: &[u64],
    use_cache: bool,
) -> Result<HashMap<u64, Row>> {
    let metrics = ctx.registry.metrics();
    let mut resolved: HashMap<u64, Option<Row>> = HashMap::with_capacity(ids.len());
    let mut missing: Vec<u64> = ids.to_vec();
    let tiers = if use_cache {
        point_tiers(ctx, schema)
    } else {
        Vec::new()
    };
    let mut missed_by: Vec<(Arc<dyn CacheTier>, Vec<u64>)> = Vec::with_capacity(tiers.len());

    for (kind, tier) in &tiers {
        if missing.is_empty() {
            break;
        }
        let keys: Vec<String> = missing.iter().map(|id| schema.point_key(*id)).collect();
        let values = match keys.as_slice() {
            [key] => vec![tier.get(key).await?],
            _ => tier.multi_get(&keys).await?,
        };

        let mut still_missing = Vec::new();
        for ((id, key), value) in missing.iter().zip(&keys).zip(values) {
            match value {
                Some(v) if v == NIL => {
                    resolved.insert(*id, None);
                }
                Some(v) => {
                    resolved.insert(*id, Some(decode_row(schema, key, &v)?));
                }
                None => still_missing.push(*id),
            }
        }
        let hits = (missing.len() - still_missing.len()) as u64;
        let misses = still_missing.len() as u64;
        match kind {
            TierKind::Shared => {
                metrics.record_shared_hits(hits);
                metrics.record_shared_misses(misses);
            }
            TierKind::Local | TierKind::Loader => {
                metrics.record_local_hits(hits);
                metrics.record_local_misses(misses);
            }
        }
        trace!(tier = ?kind, entity = %schema.entity(), hits, misses, "Point lookup");

        if !still_missing.is_empty() {
            missed_by.push((Arc::clone(tier), still_missing.clone()));
        }
        missing = still_missing;
    }

    if !missing.is_empty() {
        let filter = match missing.as_slice() {
            [id] => Filter::IdEq(*id),
            _ => Filter::IdIn(missing.clone()),
        };
        let select = Select::new(schema.table(), schema.column_names()).filter(filter);
        let connection = ctx.connection(schema.pool())?;
        for row in connection.query(&Query::Select(select)).await? {
            if let Some(id) = row.first().and_then(Value::as_id) {
                resolved.insert(id, Some(row[1..].to_vec()));
            }
        }
        for id in &missing {
            resolved.entry(*id).or_insert(None);
        }
        if connection.in_transaction() {
            // Uncommitted
            missed_by.clear();
        }
    }

    for (tier, ids) in missed_by {
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let value = match resolved.get(&id) {
                Some(Some(row)) => encode_row(schema, row)?,
                _ => NIL.to_string(),
            };
            entries.push((schema.point_key(id), value));
        }
        let count = entries.len() as u64;
        tier.multi_set(entries).await?;
        metrics.record_cache_sets(count);
    }

    Ok(resolved
        .into_iter()
        .filter_map(|(id, row)| row.map(|row| (id, row)))
        .collect())
}

/// Load one entity by ID
#[instrument(skip(ctx, schema, references), fields(entity = %schema.entity()))]
pub(crate) async fn load_by_id<T: Entity + Default>(
    ctx: ReadContext<'_>,
    schema: &Arc<EntitySchema>,
    id: u64,
    use_cache: bool,
    references: &[&str],
) -> Result<Option<T>> {
    if id == 0 {
        return Ok(None);
    }
    let mut rows = fetch_rows(ctx, schema, &[id], use_cache).await?;
    let Some(row) = rows.remove(&id) else {
        return Ok(None);
    };
    let mut entities = vec![materialize::<T>(schema, id, row)?];
    if !references.is_empty() {
        warm_up(ctx, &mut entities, references).await?;
    }
    Ok(entities.pop())
}

/// Load entities by ID in input order, with the IDs that were not found
#[instrument(skip(ctx, schema, ids, references), fields(entity = %schema.entity(), ids = ids.len()))]
pub(crate) async fn load_by_ids<T: Entity + Default>(
    ctx: ReadContext<'_>,
    schema: &Arc<EntitySchema>,
    ids: &[u64],
    references: &[&str],
) -> Result<(Vec<T>, Vec<u64>)> {
    let mut seen = HashSet::with_capacity(ids.len());
    let unique: Vec<u64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
    let lookup: Vec<u64> = unique.iter().copied().filter(|id| *id != 0).collect();

    let mut rows = if lookup.is_empty() {
        HashMap::new()
    } else {
        fetch_rows(ctx, schema, &lookup, true).await?
    };

    let mut entities = Vec::with_capacity(unique.len());
    let mut missing = Vec::new();
    for id in unique {
        match rows.remove(&id) {
            Some(row) => entities.push(materialize::<T>(schema, id, row)?),
            None => missing.push(id),
        }
    }
    if !references.is_empty() && !entities.is_empty() {
        warm_up(ctx, &mut entities, references).await?;
    }
    Ok((entities, missing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemorySharedCache, MemoryStorage};
    use crate::cache::LocalCache;
    use crate::domain::ports::{Storage, Transaction};
    use crate::entity::testing::{user_schema, User};
    use crate::schema::Registry;
    use crate::connection::{OpenTransaction, Transactions};
    use crate::flush::Effects;
    use crate::sql::{Assignment, Statement};

    struct Fixture {
        registry: Arc<Registry>,
        storage: Arc<MemoryStorage>,
        local: Arc<LocalCache>,
        shared: Arc<MemorySharedCache>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new("default"));
        let local = Arc::new(LocalCache::new("default"));
        let shared = Arc::new(MemorySharedCache::new("default"));
        let registry = Registry::builder()
            .storage(storage.clone())
            .local_cache(local.clone())
            .shared_cache(shared.clone())
            .entity(user_schema())
            .validate()
            .unwrap();
        storage
            .exec(&Statement::Insert {
                table: "User".into(),
                columns: vec!["Name".into(), "Age".into(), "Friend".into(), "FakeDelete".into()],
                rows: vec![
                    vec!["a".into(), Value::Int(10), Value::Null, Value::UInt(0)],
                    vec!["b".into(), Value::Int(18), Value::Null, Value::UInt(0)],
                ],
                on_duplicate_update: None,
            })
            .await
            .unwrap();
        storage.reset_counters();
        Fixture {
            registry,
            storage,
            local,
            shared,
        }
    }

    fn ctx(f: &Fixture) -> ReadContext<'_> {
        ReadContext {
            registry: &f.registry,
            loader: None,
            transactions: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_backfills_missed_tiers() {
        let f = fixture().await;
        let schema = Arc::clone(f.registry.schema("User").unwrap());

        let rows = fetch_rows(ctx(&f), &schema, &[1, 2, 3], true).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(f.storage.queries(), 1);
        assert_eq!(f.shared.peek(&schema.point_key(3)).as_deref(), Some(NIL));
        assert!(f.local.contains(&schema.point_key(1)));

        // Only the shared tier has key 2 now
        f.local.remove(&schema.point_key(2));
        f.shared.reset_counters();
        let rows = fetch_rows(ctx(&f), &schema, &[1, 2, 3], true).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(f.storage.queries(), 1);
        assert_eq!(f.shared.reads(), 1);
        assert!(f.local.contains(&schema.point_key(2)));
    }

    #[tokio::test]
    async fn test_bypassing_cache() {
        let f = fixture().await;
        let schema = Arc::clone(f.registry.schema("User").unwrap());
        let user: Option<User> = load_by_id(ctx(&f), &schema, 1, false, &[]).await.unwrap();
        assert_eq!(user.map(|u| u.name), Some("a".to_string()));
        assert!(f.local.is_empty());
        assert!(f.shared.is_empty());
    }

    #[tokio::test]
    async fn test_load_by_ids_order_and_missing() {
        let f = fixture().await;
        let schema = Arc::clone(f.registry.schema("User").unwrap());
        let (users, missing): (Vec<User>, _) =
            load_by_ids(ctx(&f), &schema, &[2, 9, 1, 2, 0], &[]).await.unwrap();
        assert_eq!(users.iter().map(|u| u.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(missing, vec![9, 0]);
        assert!(users.iter().all(|u| u.state.is_loaded()));
    }

    #[tokio::test]
    async fn test_data_loader_replaces_local_tier() {
        let f = fixture().await;
        let schema = Arc::clone(f.registry.schema("User").unwrap());
        let loader = Arc::new(LocalCache::new("loader"));
        let ctx = ReadContext {
            registry: &f.registry,
            loader: Some(&loader),
            transactions: None,
        };
        let user: Option<User> = load_by_id(ctx, &schema, 1, true, &[]).await.unwrap();
        assert!(user.is_some());
        assert!(loader.contains(&schema.point_key(1)));
        assert!(f.local.is_empty());
        assert!(f.shared.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_reads_are_not_cached() {
        let f = fixture().await;
        let schema = Arc::clone(f.registry.schema("User").unwrap());
        let handle = f.storage.begin().await.unwrap();
        handle
            .exec(&Statement::Update {
                table: "User".into(),
                id: 1,
                assignments: vec![Assignment {
                    column: "Age".into(),
                    value: Value::Int(11),
                }],
            })
            .await
            .unwrap();
        let mut transactions = Transactions::new();
        transactions.insert(
            "default".to_string(),
            OpenTransaction {
                handle,
                effects: Effects::default(),
            },
        );
        let inside = ReadContext {
            registry: &f.registry,
            loader: None,
            transactions: Some(&transactions),
        };

        let rows = fetch_rows(inside, &schema, &[1, 3], true).await.unwrap();
        assert_eq!(rows[&1][1], Value::Int(11));
        assert!(f.local.is_empty());
        assert!(f.shared.is_empty());

        let rows = fetch_rows(ctx(&f), &schema, &[1], true).await.unwrap();
        assert_eq!(rows[&1][1], Value::Int(10));
    }

    #[tokio::test]
    async fn test_cache_failure_is_surfaced() {
        let f = fixture().await;
        let schema = Arc::clone(f.registry.schema("User").unwrap());
        f.local.remove(&schema.point_key(1));
        f.shared.set_failing(true);
        let err = fetch_rows(ctx(&f), &schema, &[1], true).await.unwrap_err();
        assert!(err.is_backend());
        assert_eq!(f.storage.queries(), 0);
    }
}

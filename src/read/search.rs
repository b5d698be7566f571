//! Cached search
//!
//! The ID list of a cached query is stored as a hash under the search key,
//! one field per shard of [`SEARCH_SHARD_SIZE`] IDs. Shard `k` always holds
//! positions `[k*1000, (k+1)*1000)`, so any page maps to a fixed range of
//! fields. Missing fields are computed by one storage query spanning them
//! and written back with one hash-set.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{instrument, trace};

use crate::cache::codec::{decode_shard, encode_shard};
use crate::cache::key::shard_field;
use crate::cache::SEARCH_SHARD_SIZE;
use crate::error::{Error, Result};
use crate::schema::{CachedQuery, EntitySchema};
use crate::sql::{Filter, Query, Select};
use crate::value::Value;

use super::{Pager, ReadContext};

/// Inclusive range of shards covering positions `[start, end)`, `end > start`
pub(crate) fn shard_span(start: usize, end: usize) -> (usize, usize) {
    (start / SEARCH_SHARD_SIZE, (end - 1) / SEARCH_SHARD_SIZE)
}

fn filters(schema: &EntitySchema, query: &CachedQuery, params: &[Value]) -> Vec<Filter> {
    let mut filters: Vec<Filter> = query
        .fields
        .iter()
        .zip(params)
        .map(|(field, value)| Filter::Eq(field.clone(), value.clone()))
        .collect();
    if let Some(column) = schema.soft_delete() {
        filters.push(Filter::Eq(column.to_string(), Value::UInt(0)));
    }
    filters
}

/// IDs of one page of a cached query and the total number of rows
#[instrument(skip(ctx, schema, params), fields(entity = %schema.entity()))]
pub(crate) async fn search_ids(
    ctx: ReadContext<'_>,
    schema: &Arc<EntitySchema>,
    index: &str,
    pager: &Pager,
    params: &[Value],
) -> Result<(Vec<u64>, usize)> {
    let query = schema.cached_query(index)?;
    if pager.size > query.max {
        return Err(Error::PageSizeExceeded {
            index: query.name.clone(),
            requested: pager.size,
            max: query.max,
        });
    }
    let params = schema.normalize_params(query, params)?;
    let tier = ctx
        .registry
        .local_tier(schema)
        .or_else(|| ctx.registry.shared_tier(schema))
        .ok_or_else(|| Error::NoCacheTier(schema.entity().to_string()))?;
    let key = schema.search_key(query, &params);

    let start = pager.offset();
    let end = pager.end().min(query.max);
    let (first, last) = if start < end {
        shard_span(start, end)
    } else {
        (0, 0)
    };

    let fields: Vec<String> = (first..=last).map(shard_field).collect();
    let cached = tier.hash_get(&key, &fields).await?;
    let mut shards: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    let mut total = None;
    let mut missing = Vec::new();
    for (k, value) in (first..=last).zip(cached) {
        match value {
            Some(encoded) => {
                let (shard_total, ids) = decode_shard(&key, &encoded)?;
                total.get_or_insert(shard_total);
                shards.insert(k, ids);
            }
            None => missing.push(k),
        }
    }
    let metrics = ctx.registry.metrics();
    metrics.record_shard_hits(shards.len() as u64);
    metrics.record_shard_misses(missing.len() as u64);
    trace!(index, hits = shards.len(), misses = missing.len(), "Search shards");

    if let (Some(&lo_shard), Some(&hi_shard)) = (missing.first(), missing.last()) {
        let lo = lo_shard * SEARCH_SHARD_SIZE;
        let hi = ((hi_shard + 1) * SEARCH_SHARD_SIZE).min(query.max);
        let connection = ctx.connection(schema.pool())?;
        let conditions = filters(schema, query, &params);

        let mut select = Select::new(schema.table(), vec![crate::schema::ID_COLUMN.to_string()]);
        for filter in conditions.iter().cloned() {
            select = select.filter(filter);
        }
        for (column, order) in query.effective_order() {
            select = select.order_by(column, order);
        }
        let select = select.limit(lo, hi.saturating_sub(lo));
        let ids: Vec<u64> = connection.query(&Query::Select(select))
            .await?
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_id))
            .collect();

        let window = hi.saturating_sub(lo);
        let fresh_total = if ids.len() < window && (!ids.is_empty() || lo == 0) {
            lo + ids.len()
        } else {
            let count = Query::Count {
                table: schema.table().to_string(),
                filters: conditions,
            };
            let rows = connection.query(&count).await?;
            let count = rows
                .first()
                .and_then(|row| row.first())
                .and_then(Value::as_id)
                .unwrap_or(0) as usize;
            count.min(query.max)
        };
        total = Some(fresh_total);

        let mut entries = Vec::with_capacity(missing.len());
        for k in &missing {
            let from = (k * SEARCH_SHARD_SIZE - lo).min(ids.len());
            let to = ((k + 1) * SEARCH_SHARD_SIZE - lo).min(ids.len());
            let shard = ids[from..to].to_vec();
            entries.push((shard_field(*k), encode_shard(fresh_total, &shard)));
            shards.insert(*k, shard);
        }
        if !connection.in_transaction() {
            tier.hash_set(&key, entries).await?;
            metrics.record_cache_sets(1);
        }
    }

    let total = total.unwrap_or(0);
    if start >= end {
        return Ok((Vec::new(), total));
    }
    let skip = start - first * SEARCH_SHARD_SIZE;
    let page = shards
        .into_values()
        .flatten()
        .skip(skip)
        .take(end - start)
        .collect();
    Ok((page, total))
}

//! Cache Side Effects
//!
//! Cache writes, invalidations and events produced by successful flush
//! operations. Effects are collected first and applied strictly after the
//! storage statements were acknowledged; inside a transaction they wait for
//! the commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{trace, warn};

use crate::cache::codec::encode_row;
use crate::cache::LocalCache;
use crate::domain::events::{FlushAction, QueueEvent};
use crate::domain::ports::{CacheTier, NIL};
use crate::error::Result;
use crate::schema::{EntitySchema, Registry};
use crate::sql::Row;

use super::plan::FlushOp;

/// Cache tier addressed by an effect
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TierKey {
    Local(String),
    Shared(String),
    /// Request-scoped data loader of the session
    Loader,
}

#[derive(Debug, Default)]
struct TierBatch {
    sets: BTreeMap<String, String>,
    deletes: BTreeSet<String>,
}

/// Pending cache writes, invalidations and events
#[derive(Debug, Default)]
pub(crate) struct Effects {
    tiers: BTreeMap<TierKey, TierBatch>,
    events: Vec<(String, QueueEvent)>,
    invalidations: u64,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty() && self.events.is_empty()
    }

    fn set(&mut self, tier: TierKey, key: String, value: String) {
        let batch = self.tiers.entry(tier).or_default();
        batch.deletes.remove(&key);
        batch.sets.insert(key, value);
    }

    fn delete(&mut self, tier: TierKey, key: String) {
        let batch = self.tiers.entry(tier).or_default();
        batch.sets.remove(&key);
        batch.deletes.insert(key);
    }

    fn tiers_of(schema: &EntitySchema, loader: bool) -> Vec<TierKey> {
        let mut tiers = Vec::with_capacity(3);
        if let Some(pool) = schema.local_cache() {
            tiers.push(TierKey::Local(pool.to_string()));
        }
        if let Some(pool) = schema.shared_cache() {
            tiers.push(TierKey::Shared(pool.to_string()));
        }
        if loader {
            tiers.push(TierKey::Loader);
        }
        tiers
    }

    /// Store a row (or the negative sentinel) under its point key
    pub fn set_point(
        &mut self,
        schema: &EntitySchema,
        id: u64,
        row: Option<&Row>,
        loader: bool,
    ) -> Result<()> {
        let value = match row {
            Some(row) => encode_row(schema, row)?,
            None => NIL.to_string(),
        };
        let key = schema.point_key(id);
        for tier in Self::tiers_of(schema, loader) {
            self.set(tier, key.clone(), value.clone());
        }
        Ok(())
    }

    /// Drop a point key from every tier
    pub fn delete_point(&mut self, schema: &EntitySchema, id: u64, loader: bool) {
        let key = schema.point_key(id);
        for tier in Self::tiers_of(schema, loader) {
            self.delete(tier, key.clone());
        }
    }

    /// Drop the search keys a row change can affect, for old and new
    /// parameter values
    pub fn invalidate_searches(
        &mut self,
        schema: &EntitySchema,
        action: FlushAction,
        changed: &[String],
        before: Option<&Row>,
        after: Option<&Row>,
        loader: bool,
    ) {
        let mut keys = BTreeSet::new();
        for query in schema.cached_queries() {
            let affected = action != FlushAction::Update
                || query.is_affected_by(changed.iter().map(String::as_str), schema.soft_delete());
            if !affected {
                continue;
            }
            for row in before.into_iter().chain(after) {
                keys.insert(schema.search_key(query, &schema.params_from_row(query, row)));
            }
        }
        self.invalidations += keys.len() as u64;
        for key in keys {
            for tier in Self::tiers_of(schema, loader) {
                self.delete(tier, key.clone());
            }
        }
    }

    /// Queue an event for a channel
    pub fn publish(&mut self, channel: &str, event: QueueEvent) {
        self.events.push((channel.to_string(), event));
    }

    /// Record the complete effect set of a successful operation
    pub fn record_op(&mut self, op: &FlushOp, loader: bool) -> Result<()> {
        let schema = &op.schema;
        let changed = op.changed();
        match op.action {
            FlushAction::Insert | FlushAction::Update => {
                self.set_point(schema, op.id, Some(&op.after), loader)?
            }
            FlushAction::Delete => self.set_point(schema, op.id, None, loader)?,
        }
        let after = (op.action != FlushAction::Delete).then_some(&op.after);
        self.invalidate_searches(schema, op.action, &changed, op.before.as_ref(), after, loader);
        self.record_events(op, &changed);
        Ok(())
    }

    /// Dirty and log events of an operation
    pub fn record_events(&mut self, op: &FlushOp, changed: &[String]) {
        let schema = &op.schema;
        let action = op.event_action();
        for channel in schema.dirty_channels() {
            if action == FlushAction::Update && !channel.wants(changed.iter().map(String::as_str)) {
                continue;
            }
            self.publish(
                &channel.name,
                QueueEvent::dirty(schema.entity(), op.id, action, changed.to_vec()),
            );
        }
        if let Some(channel) = schema.log_channel() {
            let before = match op.action {
                FlushAction::Insert => None,
                _ => op.before.as_ref().map(|row| op.log_values(row)),
            };
            let changes = match op.action {
                FlushAction::Delete => BTreeMap::new(),
                _ => op.log_values(&op.after),
            };
            self.publish(
                channel,
                QueueEvent::Log {
                    entity: schema.entity().to_string(),
                    table: schema.table().to_string(),
                    pool: schema.pool().to_string(),
                    id: op.id,
                    action,
                    before,
                    changes,
                    timestamp: Utc::now(),
                },
            );
        }
    }

    /// Apply every effect. Cache failures are returned after all tiers and
    /// events were attempted.
    pub async fn apply(self, registry: &Registry, loader: Option<&Arc<LocalCache>>) -> Result<()> {
        let metrics = registry.metrics();
        let mut first_error = None;

        for (key, batch) in self.tiers {
            let tier: Option<Arc<dyn CacheTier>> = match &key {
                TierKey::Local(pool) => registry.local_cache(pool).ok().cloned(),
                TierKey::Shared(pool) => registry.shared_cache(pool).ok().cloned(),
                TierKey::Loader => loader.map(|l| {
                    let tier: Arc<dyn CacheTier> = l.clone();
                    tier
                }),
            };
            let Some(tier) = tier else {
                continue;
            };
            if !batch.sets.is_empty() {
                let count = batch.sets.len() as u64;
                trace!(tier = ?key, count, "Populating cache keys");
                match tier.multi_set(batch.sets.into_iter().collect()).await {
                    Ok(()) => metrics.record_cache_sets(count),
                    Err(e) => {
                        warn!(tier = ?key, error = %e, "Cache population failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            if !batch.deletes.is_empty() {
                let keys: Vec<String> = batch.deletes.into_iter().collect();
                trace!(tier = ?key, count = keys.len(), "Invalidating cache keys");
                match tier.delete(&keys).await {
                    Ok(()) => metrics.record_cache_deletes(keys.len() as u64),
                    Err(e) => {
                        warn!(tier = ?key, error = %e, "Cache invalidation failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        metrics.record_invalidations(self.invalidations);

        let publisher = registry.publisher();
        for (channel, event) in self.events {
            match publisher.publish(&channel, event).await {
                Ok(()) => metrics.record_events(1),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Event publish failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::testing::user_schema;
    use crate::value::Value;

    fn row(age: i64, deleted: u64) -> Row {
        vec![
            Value::from("Tom"),
            Value::Int(age),
            Value::Null,
            Value::UInt(deleted),
        ]
    }

    #[test]
    fn test_update_invalidates_old_and_new_buckets() {
        let schema = user_schema();
        let mut effects = Effects::default();
        effects.invalidate_searches(
            &schema,
            FlushAction::Update,
            &["Age".to_string()],
            Some(&row(10, 0)),
            Some(&row(18, 0)),
            false,
        );
        let query = schema.cached_query("IndexAge").unwrap();
        let old_key = schema.search_key(query, &[Value::Int(10)]);
        let new_key = schema.search_key(query, &[Value::Int(18)]);
        let local = &effects.tiers[&TierKey::Local("default".into())];
        assert!(local.deletes.contains(&old_key));
        assert!(local.deletes.contains(&new_key));
        // IndexAll has no bound fields and is untouched by Age
        assert_eq!(local.deletes.len(), 2);
        assert_eq!(effects.invalidations, 2);
    }

    #[test]
    fn test_unrelated_update_invalidates_nothing() {
        let schema = user_schema();
        let mut effects = Effects::default();
        effects.invalidate_searches(
            &schema,
            FlushAction::Update,
            &["Name".to_string()],
            Some(&row(10, 0)),
            Some(&row(10, 0)),
            false,
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_set_then_delete_same_key() {
        let schema = user_schema();
        let mut effects = Effects::default();
        effects.set_point(&schema, 1, Some(&row(10, 0)), true).unwrap();
        effects.delete_point(&schema, 1, true);
        let loader = &effects.tiers[&TierKey::Loader];
        assert!(loader.sets.is_empty());
        assert_eq!(loader.deletes.len(), 1);
        assert_eq!(effects.tiers.len(), 3);
    }
}

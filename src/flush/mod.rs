//! Flush Engine
//!
//! Persists dirty entities with the fewest statements and then brings every
//! cache tier and event channel in line with storage.
//!
//! # Pipeline
//!
//! ```text
//! entities ──▶ unsaved references (leaves first) ──▶ plan ──▶ group
//!                                                             │
//!     ┌───────────────────────────┬───────────────────────────┤
//!     ▼                           ▼                           ▼
//!  INSERT per (pool, table)   UPDATEs per pool           DELETE per (pool, table)
//!  multi-row, IDs written     one atomic round trip      restrict check, cascade
//!     └───────────────────────────┴───────────────────────────┘
//!                                 │
//!                    write-back ──▶ cache effects ──▶ events
//! ```
//!
//! Each group is all-or-nothing. A failed group does not stop the others;
//! the first failure is returned after every group was attempted. Inside a
//! session transaction the statements of a pool run through its handle and
//! the cache effects wait for the commit.

mod effects;
mod lazy;
mod plan;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, instrument, trace};

use crate::cache::LocalCache;
use crate::connection::{Connection, Transactions};
use crate::domain::events::FlushAction;
use crate::entity::{handle_key, Entity, SharedEntity};
use crate::error::{Error, Result};
use crate::schema::{EntitySchema, OnDelete, Registry, ID_COLUMN};
use crate::sql::{Filter, Query, Row, Select, SortOrder, Statement};
use crate::value::Value;

pub(crate) use effects::Effects;
pub(crate) use lazy::apply_lazy;

use plan::{cascade_op, plan_op, FlushOp, Target};

/// Default number of referencing rows loaded per cascade page
pub const DEFAULT_CASCADE_BATCH_SIZE: usize = 1000;

/// Flush tuning
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Referencing rows loaded per page while cascading a delete
    pub cascade_batch_size: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            cascade_batch_size: DEFAULT_CASCADE_BATCH_SIZE,
        }
    }
}

impl FlushConfig {
    /// Override the cascade page size
    pub fn with_cascade_batch_size(mut self, size: usize) -> Self {
        self.cascade_batch_size = size.max(1);
        self
    }
}

/// How planned operations reach storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushMode {
    /// Execute now
    Immediate,
    /// Queue statements on the lazy channel
    Lazy,
}

/// Session state a flush works against
pub(crate) struct FlushContext<'a> {
    pub registry: &'a Registry,
    pub loader: Option<&'a Arc<LocalCache>>,
    /// Open transactions of the session, by pool
    pub transactions: &'a mut Transactions,
}

/// IDs scheduled for a hard delete by one flush, by table
pub(crate) type Scheduled = HashMap<String, HashSet<u64>>;

fn scheduled_deletes(ops: &[FlushOp]) -> Scheduled {
    let mut scheduled = Scheduled::new();
    for op in ops.iter().filter(|op| op.action == FlushAction::Delete) {
        scheduled
            .entry(op.schema.table().to_string())
            .or_default()
            .insert(op.id);
    }
    scheduled
}

/// Flush a batch of entities and the unsaved entities they reference
#[instrument(skip(ctx, roots), fields(entities = roots.len()))]
pub(crate) async fn flush(
    ctx: &mut FlushContext<'_>,
    roots: &mut [&mut dyn Entity],
    mode: FlushMode,
) -> Result<()> {
    let levels = unsaved_dependencies(roots)?;
    for (depth, level) in levels.into_iter().enumerate() {
        debug!(depth, entities = level.len(), "Flushing unsaved references");
        let targets = level.into_iter().map(Target::Shared).collect();
        let mut none: Vec<&mut dyn Entity> = Vec::new();
        run(ctx, &mut none, targets, FlushMode::Immediate).await?;
    }

    let targets = (0..roots.len()).map(Target::Root).collect();
    run(ctx, roots, targets, mode).await
}

async fn run(
    ctx: &mut FlushContext<'_>,
    roots: &mut [&mut dyn Entity],
    targets: Vec<Target>,
    mode: FlushMode,
) -> Result<()> {
    let ops = plan_targets(ctx.registry, roots, targets)?;
    if ops.is_empty() {
        trace!("Nothing to flush");
        return Ok(());
    }
    match mode {
        FlushMode::Immediate => execute(ctx, roots, ops).await,
        FlushMode::Lazy => lazy::queue(ctx, roots, ops).await,
    }
}

/// Plan every target. Any planning error aborts before a single write.
fn plan_targets(
    registry: &Registry,
    roots: &[&mut dyn Entity],
    targets: Vec<Target>,
) -> Result<Vec<FlushOp>> {
    let mut ops = Vec::with_capacity(targets.len());
    for target in targets {
        let op = match &target {
            Target::Root(i) => {
                let entity: &dyn Entity = &*roots[*i];
                let schema = registry.schema(entity.entity_name())?;
                plan_op(schema, entity, target.clone())?
            }
            Target::Shared(handle) => {
                let entity = handle.read();
                let schema = registry.schema(entity.entity_name())?;
                plan_op(schema, &*entity, target.clone())?
            }
            Target::Detached => None,
        };
        ops.extend(op);
    }
    Ok(ops)
}

// =============================================================================
// Unsaved references
// =============================================================================

#[derive(Default)]
struct DependencyWalk {
    levels: HashMap<usize, (usize, SharedEntity)>,
    in_progress: HashSet<usize>,
    path: Vec<&'static str>,
}

impl DependencyWalk {
    /// Depth of a handle above the leaves of the unsaved graph
    fn visit(&mut self, handle: &SharedEntity) -> Result<usize> {
        let key = handle_key(handle);
        if let Some((level, _)) = self.levels.get(&key) {
            return Ok(*level);
        }
        let (name, dependencies) = {
            let Some(entity) = handle.try_read() else {
                return Err(self.cycle("<locked>"));
            };
            let dependencies: Vec<SharedEntity> = entity
                .reference_slots()
                .iter()
                .flat_map(|(_, slot)| slot.unsaved_targets())
                .collect();
            (entity.entity_name(), dependencies)
        };
        if !self.in_progress.insert(key) {
            return Err(self.cycle(name));
        }
        self.path.push(name);

        let mut level = 0;
        for dependency in &dependencies {
            level = level.max(self.visit(dependency)? + 1);
        }

        self.path.pop();
        self.in_progress.remove(&key);
        self.levels.insert(key, (level, Arc::clone(handle)));
        Ok(level)
    }

    fn cycle(&self, entity: &str) -> Error {
        let mut path: Vec<&str> = self.path.clone();
        path.push(entity);
        Error::FlushCycle {
            entity: entity.to_string(),
            path: path.join(" -> "),
        }
    }
}

/// Unsaved entities reachable from the roots, grouped leaves first
fn unsaved_dependencies(roots: &[&mut dyn Entity]) -> Result<Vec<Vec<SharedEntity>>> {
    let mut walk = DependencyWalk::default();
    for root in roots.iter().filter(|r| !r.state().is_pending_delete()) {
        walk.path.push(root.entity_name());
        for (_, slot) in root.reference_slots() {
            for target in slot.unsaved_targets() {
                walk.visit(&target)?;
            }
        }
        walk.path.pop();
    }

    let mut levels: Vec<Vec<SharedEntity>> = Vec::new();
    for (level, handle) in walk.levels.into_values() {
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(handle);
    }
    Ok(levels)
}

// =============================================================================
// Execution
// =============================================================================

async fn execute(
    ctx: &mut FlushContext<'_>,
    roots: &mut [&mut dyn Entity],
    ops: Vec<FlushOp>,
) -> Result<()> {
    let registry = ctx.registry;
    let scheduled = scheduled_deletes(&ops);
    let mut inserts: BTreeMap<(String, String, bool), Vec<FlushOp>> = BTreeMap::new();
    let mut updates: BTreeMap<String, Vec<FlushOp>> = BTreeMap::new();
    let mut deletes: BTreeMap<(String, String), Vec<FlushOp>> = BTreeMap::new();
    for op in ops {
        let pool = op.schema.pool().to_string();
        let table = op.schema.table().to_string();
        match op.action {
            FlushAction::Insert => inserts
                .entry((pool, table, op.explicit_id))
                .or_default()
                .push(op),
            FlushAction::Update => updates.entry(pool).or_default().push(op),
            FlushAction::Delete => deletes.entry((pool, table)).or_default().push(op),
        }
    }

    let mut done = Vec::new();
    let mut first_error = None;
    {
        let transactions = &*ctx.transactions;
        for ((pool, table, _), group) in inserts {
            let result = match Connection::open(registry, Some(transactions), &pool) {
                Ok(connection) => execute_inserts(connection, group, &mut done).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(pool = %pool, table = %table, error = %e, "Insert group failed");
                first_error.get_or_insert(e);
            }
        }
        for (pool, group) in updates {
            let result = match Connection::open(registry, Some(transactions), &pool) {
                Ok(connection) => execute_updates(connection, group, &mut done).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(pool = %pool, error = %e, "Update group failed");
                first_error.get_or_insert(e);
            }
        }
        for ((pool, table), group) in deletes {
            let result =
                execute_deletes(registry, transactions, &scheduled, group, &mut done).await;
            if let Err(e) = result {
                error!(pool = %pool, table = %table, error = %e, "Delete group failed");
                first_error.get_or_insert(e);
            }
        }
    }

    let loader = ctx.loader.is_some();
    let mut effects = Effects::default();
    for op in &done {
        write_back(roots, op)?;
        match ctx.transactions.get_mut(op.schema.pool()) {
            Some(open) => open.effects.record_op(op, loader)?,
            None => effects.record_op(op, loader)?,
        }
    }
    let applied = effects.apply(registry, ctx.loader).await;

    match first_error {
        Some(e) => Err(e),
        None => applied,
    }
}

async fn execute_inserts(
    connection: Connection<'_>,
    group: Vec<FlushOp>,
    done: &mut Vec<FlushOp>,
) -> Result<()> {
    let Some(schema) = group.first().map(|op| Arc::clone(&op.schema)) else {
        return Ok(());
    };

    if schema.on_duplicate_update().is_some() {
        for mut op in group {
            let result = connection.exec(&op.statement()).await?;
            if result.rows_affected == 1 {
                if !op.explicit_id {
                    op.id = result.last_insert_id;
                }
            } else {
                let (id, row) = resolve_unique(connection, &schema, &op.after).await?;
                debug!(entity = %schema.entity(), id, "Upsert hit an existing row");
                op.id = id;
                op.after = row;
            }
            done.push(op);
        }
        return Ok(());
    }

    let explicit = group[0].explicit_id;
    let (columns, _) = group[0].insert_row();
    let rows = group.iter().map(|op| op.insert_row().1).collect();
    let statement = Statement::Insert {
        table: schema.table().to_string(),
        columns,
        rows,
        on_duplicate_update: None,
    };
    let result = connection.exec(&statement).await?;
    let step = connection.auto_increment_step();
    for (i, mut op) in group.into_iter().enumerate() {
        if !explicit {
            op.id = result.last_insert_id + i as u64 * step;
        }
        done.push(op);
    }
    Ok(())
}

/// Find the stored row matching one of the unique indexes of `row`
async fn resolve_unique(
    connection: Connection<'_>,
    schema: &EntitySchema,
    row: &Row,
) -> Result<(u64, Row)> {
    for columns in schema.unique_indexes().values() {
        let mut select = Select::new(schema.table(), schema.column_names());
        let mut complete = true;
        for column in columns {
            match schema.row_position(column).map(|p| &row[p]) {
                Some(value) if !value.is_null() => {
                    select = select.filter(Filter::Eq(column.clone(), value.clone()));
                }
                _ => complete = false,
            }
        }
        if !complete {
            continue;
        }
        let query = Query::Select(select.limit(0, 1));
        if let Some(found) = connection.query(&query).await?.into_iter().next() {
            let id = found.first().and_then(Value::as_id).unwrap_or(0);
            return Ok((id, found[1..].to_vec()));
        }
    }
    Err(Error::storage(
        connection.pool(),
        format!("upserted row of '{}' not found by unique index", schema.entity()),
    ))
}

/// Send every update of a pool in one round trip.
///
/// Outside a session transaction the batch is all-or-nothing. Inside one,
/// the statements applied before a failure keep their deferred effects so
/// the cache matches whatever the transaction commits.
async fn execute_updates(
    connection: Connection<'_>,
    group: Vec<FlushOp>,
    done: &mut Vec<FlushOp>,
) -> Result<()> {
    let statements: Vec<Statement> = group.iter().map(FlushOp::statement).collect();
    if connection.in_transaction() || statements.len() == 1 {
        let batch = connection.exec_batch(&statements).await;
        done.extend(group.into_iter().take(batch.applied()));
        return batch.into_result().map(drop);
    }
    connection.exec_batch_atomic(&statements).await?;
    done.extend(group);
    Ok(())
}

async fn execute_deletes(
    registry: &Registry,
    transactions: &Transactions,
    scheduled: &Scheduled,
    group: Vec<FlushOp>,
    done: &mut Vec<FlushOp>,
) -> Result<()> {
    let Some(schema) = group.first().map(|op| Arc::clone(&op.schema)) else {
        return Ok(());
    };
    let ids: Vec<u64> = group.iter().map(|op| op.id).collect();

    let cascade = collect_cascade(registry, Some(transactions), scheduled, &schema, &ids).await?;
    for (child, ops) in cascade {
        let connection = Connection::open(registry, Some(transactions), child.pool())?;
        let statement = Statement::Delete {
            table: child.table().to_string(),
            ids: ops.iter().map(|op| op.id).collect(),
        };
        connection.exec(&statement).await?;
        done.extend(ops);
    }

    let connection = Connection::open(registry, Some(transactions), schema.pool())?;
    let statement = Statement::Delete {
        table: schema.table().to_string(),
        ids,
    };
    connection.exec(&statement).await?;
    done.extend(group);
    Ok(())
}

/// Walk the referrers of rows about to be deleted. Restrict referrers fail
/// the delete unless the flush deletes them too; cascade referrers are
/// collected, deepest level first.
pub(crate) async fn collect_cascade(
    registry: &Registry,
    transactions: Option<&Transactions>,
    scheduled: &Scheduled,
    schema: &Arc<EntitySchema>,
    ids: &[u64],
) -> Result<Vec<(Arc<EntitySchema>, Vec<FlushOp>)>> {
    let batch_size = registry.flush_config().cascade_batch_size;
    let mut scheduled = scheduled.clone();
    scheduled
        .entry(schema.table().to_string())
        .or_default()
        .extend(ids.iter().copied());

    let mut queue = VecDeque::from([(Arc::clone(schema), ids.to_vec())]);
    let mut levels = Vec::new();
    while let Some((target, ids)) = queue.pop_front() {
        let id_values: Vec<Value> = ids.iter().map(|id| Value::UInt(*id)).collect();
        for referrer in registry.referrers(target.entity()) {
            let child = &referrer.schema;
            let connection = Connection::open(registry, transactions, child.pool())?;
            match referrer.on_delete {
                OnDelete::Restrict => {
                    let mut select = Select::new(child.table(), vec![ID_COLUMN.to_string()])
                        .filter(Filter::In(referrer.column.clone(), id_values.clone()));
                    if let Some(excluded) = scheduled.get(child.table()) {
                        select = select.filter(Filter::IdNotIn(excluded.iter().copied().collect()));
                    }
                    let query = Query::Select(select.limit(0, 1));
                    if let Some(row) = connection.query(&query).await?.first() {
                        let id = row.first().and_then(Value::as_id).unwrap_or(0);
                        return Err(Error::ForeignKey {
                            constraint: format!("{}:{}", child.table(), referrer.column),
                            message: format!(
                                "row {} of '{}' still references '{}'",
                                id,
                                child.table(),
                                target.table()
                            ),
                        });
                    }
                }
                OnDelete::Cascade => {
                    let mut found = Vec::new();
                    let mut last = 0;
                    loop {
                        let select = Select::new(child.table(), child.column_names())
                            .filter(Filter::In(referrer.column.clone(), id_values.clone()))
                            .filter(Filter::IdGt(last))
                            .order_by(ID_COLUMN, SortOrder::Asc)
                            .limit(0, batch_size);
                        let rows = connection.query(&Query::Select(select)).await?;
                        let page = rows.len();
                        for row in rows {
                            let id = row.first().and_then(Value::as_id).unwrap_or(0);
                            last = id;
                            let seen = scheduled.entry(child.table().to_string()).or_default();
                            if seen.insert(id) {
                                found.push(cascade_op(child, id, row[1..].to_vec()));
                            }
                        }
                        if page < batch_size {
                            break;
                        }
                    }
                    if !found.is_empty() {
                        debug!(
                            parent = %target.entity(),
                            child = %child.entity(),
                            rows = found.len(),
                            "Cascading delete"
                        );
                        queue.push_back((Arc::clone(child), found.iter().map(|op| op.id).collect()));
                        levels.push((Arc::clone(child), found));
                    }
                }
            }
        }
    }
    levels.reverse();
    Ok(levels)
}

// =============================================================================
// Write-back
// =============================================================================

/// Copy the outcome of an operation into its entity
fn write_back(roots: &mut [&mut dyn Entity], op: &FlushOp) -> Result<()> {
    match &op.target {
        Target::Root(i) => apply_outcome(&mut *roots[*i], op),
        Target::Shared(handle) => apply_outcome(&mut *handle.write(), op),
        Target::Detached => Ok(()),
    }
}

fn apply_outcome(entity: &mut dyn Entity, op: &FlushOp) -> Result<()> {
    match op.action {
        FlushAction::Insert => {
            entity.set_id(op.id);
            if op.schema.on_duplicate_update().is_some() {
                entity.apply_column_values(&op.after)?;
            }
            entity.state_mut().mark_loaded(&op.schema, op.after.clone());
        }
        FlushAction::Update => {
            if op.soft_delete {
                entity.apply_column_values(&op.after)?;
            }
            entity.state_mut().mark_loaded(&op.schema, op.after.clone());
        }
        FlushAction::Delete => entity.state_mut().mark_deleted(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::testing::User;
    use crate::entity::Reference;
    use assert_matches::assert_matches;
    use parking_lot::RwLock;

    #[test]
    fn test_config_defaults() {
        let config = FlushConfig::default();
        assert_eq!(config.cascade_batch_size, 1000);
        assert_eq!(config.with_cascade_batch_size(0).cascade_batch_size, 1);
    }

    #[test]
    fn test_dependency_levels() {
        let leaf = Arc::new(RwLock::new(User::new("leaf", 1)));
        let mut middle = User::new("middle", 2);
        middle.friend = Reference::from_shared(Arc::clone(&leaf));
        let middle = Arc::new(RwLock::new(middle));

        let mut root = User::new("root", 3);
        root.friend = Reference::from_shared(Arc::clone(&middle));
        let mut roots: Vec<&mut dyn Entity> = vec![&mut root];

        let levels = unsaved_dependencies(&roots).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 1);
        assert_eq!(levels[0][0].read().id(), 0);
        assert_eq!(levels[1].len(), 1);

        roots[0].state_mut().mark_to_delete();
        assert!(unsaved_dependencies(&roots).unwrap().is_empty());
    }

    #[test]
    fn test_shared_dependency_visited_once() {
        let leaf = Arc::new(RwLock::new(User::new("leaf", 1)));
        let mut a = User::new("a", 2);
        a.friend = Reference::from_shared(Arc::clone(&leaf));
        let mut b = User::new("b", 3);
        b.friend = Reference::from_shared(Arc::clone(&leaf));
        let roots: Vec<&mut dyn Entity> = vec![&mut a, &mut b];

        let levels = unsaved_dependencies(&roots).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 1);
    }

    #[test]
    fn test_cycle_detected() {
        let a = Arc::new(RwLock::new(User::new("a", 1)));
        let b = Arc::new(RwLock::new(User::new("b", 2)));
        a.write().friend = Reference::from_shared(Arc::clone(&b));
        b.write().friend = Reference::from_shared(Arc::clone(&a));

        let mut root = User::new("root", 3);
        root.friend = Reference::from_shared(Arc::clone(&a));
        let roots: Vec<&mut dyn Entity> = vec![&mut root];

        let Err(err) = unsaved_dependencies(&roots) else {
            panic!("cycle not detected");
        };
        assert_matches!(err, Error::FlushCycle { ref path, .. } if path == "User -> User -> User -> User");
        assert!(err.is_configuration());

        // Break the cycle so the handles can drop
        a.write().friend = Reference::new();
    }
}

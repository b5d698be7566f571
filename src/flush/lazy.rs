//! Lazy Flush
//!
//! Statements are queued on the lazy channel instead of being executed.
//! Invalidations happen at once; rows of queued inserts are cached only when
//! a consumer applies the statement with [`apply_lazy`].

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::cache::LocalCache;
use crate::connection::Connection;
use crate::domain::events::{FlushAction, QueueEvent, LAZY_CHANNEL};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::schema::{Registry, ID_COLUMN};
use crate::sql::Statement;
use crate::value::Value;

use super::effects::Effects;
use super::plan::{FlushOp, Target};
use super::{collect_cascade, resolve_unique, scheduled_deletes, write_back, FlushContext};

/// Queue planned operations and apply their immediate effects
pub(super) async fn queue(
    ctx: &mut FlushContext<'_>,
    roots: &mut [&mut dyn Entity],
    ops: Vec<FlushOp>,
) -> Result<()> {
    let registry = ctx.registry;
    let scheduled = scheduled_deletes(&ops);
    let loader = ctx.loader.is_some();
    let mut effects = Effects::default();
    let mut events = Vec::with_capacity(ops.len());

    for op in &ops {
        if op.action == FlushAction::Delete {
            let transactions = Some(&*ctx.transactions);
            let cascade =
                collect_cascade(registry, transactions, &scheduled, &op.schema, &[op.id]).await?;
            for (child, children) in cascade {
                events.push(QueueEvent::lazy(
                    child.entity(),
                    Statement::Delete {
                        table: child.table().to_string(),
                        ids: children.iter().map(|c| c.id).collect(),
                    },
                ));
                for child_op in &children {
                    effects.record_op(child_op, loader)?;
                }
            }
        }
        events.push(QueueEvent::lazy(op.schema.entity(), op.statement()));
        match op.action {
            FlushAction::Insert => effects.invalidate_searches(
                &op.schema,
                FlushAction::Insert,
                &op.changed(),
                None,
                Some(&op.after),
                loader,
            ),
            FlushAction::Update | FlushAction::Delete => effects.record_op(op, loader)?,
        }
    }

    let count = events.len() as u64;
    debug!(statements = count, "Queueing lazy statements");
    registry.publisher().publish_all(LAZY_CHANNEL, events).await?;
    registry.metrics().record_events(count);

    for op in &ops {
        write_back(roots, op)?;
    }
    effects.apply(registry, ctx.loader).await
}

/// Execute a queued lazy statement and perform its deferred cache work.
///
/// The statement runs on the pool, outside any session transaction.
///
/// Updates drop the point key and deletes store the negative sentinel, so a
/// read between queueing and applying can never pin a stale row.
#[instrument(skip(registry, loader, event), fields(entity = %event.entity()))]
pub(crate) async fn apply_lazy(
    registry: &Registry,
    loader: Option<&Arc<LocalCache>>,
    event: &QueueEvent,
) -> Result<()> {
    let QueueEvent::Lazy {
        entity, statement, ..
    } = event
    else {
        return Err(Error::Internal(format!(
            "expected a lazy event, got {}",
            event.event_type()
        )));
    };
    let schema = Arc::clone(registry.schema(entity)?);
    let connection = Connection::open(registry, None, schema.pool())?;
    let result = connection.exec(statement).await?;

    let loader_on = loader.is_some();
    let mut effects = Effects::default();
    match statement {
        Statement::Insert {
            columns,
            rows,
            on_duplicate_update,
            ..
        } => {
            let explicit = columns.first().map(String::as_str) == Some(ID_COLUMN);
            let step = connection.auto_increment_step();
            for (i, row) in rows.iter().enumerate() {
                let (mut id, mut after) = if explicit {
                    let id = row.first().and_then(Value::as_id).unwrap_or(0);
                    (id, row[1..].to_vec())
                } else {
                    (result.last_insert_id + i as u64 * step, row.clone())
                };
                if on_duplicate_update.is_some() && result.rows_affected != 1 {
                    (id, after) = resolve_unique(connection, &schema, &after).await?;
                }
                let bind = schema
                    .data_columns()
                    .iter()
                    .zip(&after)
                    .filter(|(column, value)| **value != column.zero())
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect();
                let op = FlushOp {
                    schema: Arc::clone(&schema),
                    action: FlushAction::Insert,
                    id,
                    before: None,
                    after,
                    bind,
                    target: Target::Detached,
                    soft_delete: false,
                    explicit_id: explicit,
                };
                effects.record_op(&op, loader_on)?;
            }
        }
        Statement::Update { id, .. } => effects.delete_point(&schema, *id, loader_on),
        Statement::Delete { ids, .. } => {
            for id in ids {
                effects.set_point(&schema, *id, None, loader_on)?;
            }
        }
    }
    effects.apply(registry, loader).await
}

//! Flush Planning
//!
//! Turns dirty entities into [`FlushOp`]s: the action, the before and after
//! rows and the changed columns. Planning only reads entities; execution and
//! write-back happen later so no lock is held across storage calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dirty::row_diff;
use crate::domain::events::FlushAction;
use crate::entity::{DeleteMark, Entity, SharedEntity};
use crate::error::{Error, Result};
use crate::schema::EntitySchema;
use crate::sql::{Assignment, Row, Statement};
use crate::value::Value;

/// Where the result of an operation is written back
#[derive(Clone)]
pub(crate) enum Target {
    /// Entity passed to the flush call, by index
    Root(usize),
    /// Unsaved entity reached through a reference
    Shared(SharedEntity),
    /// Row not backed by an entity (cascades, queued statements)
    Detached,
}

/// One planned row change
#[derive(Clone)]
pub(crate) struct FlushOp {
    pub schema: Arc<EntitySchema>,
    pub action: FlushAction,
    pub id: u64,
    /// Snapshot of a loaded entity
    pub before: Option<Row>,
    /// Row after the change (the snapshot again for deletes)
    pub after: Row,
    /// Changed columns with their new values in schema order
    pub bind: Vec<(String, Value)>,
    pub target: Target,
    /// Delete executed as a soft-delete marker update
    pub soft_delete: bool,
    /// Insert carrying a caller-chosen ID
    pub explicit_id: bool,
}

impl FlushOp {
    /// Names of the changed columns
    pub fn changed(&self) -> Vec<String> {
        self.bind.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Action reported to dirty and log channels
    pub fn event_action(&self) -> FlushAction {
        if self.soft_delete {
            FlushAction::Delete
        } else {
            self.action
        }
    }

    /// Assignments of an update
    pub fn assignments(&self) -> Vec<Assignment> {
        self.bind
            .iter()
            .map(|(column, value)| Assignment {
                column: column.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Standalone statement for this operation
    pub fn statement(&self) -> Statement {
        let table = self.schema.table().to_string();
        match self.action {
            FlushAction::Insert => {
                let (columns, row) = self.insert_row();
                Statement::Insert {
                    table,
                    columns,
                    rows: vec![row],
                    on_duplicate_update: self
                        .schema
                        .on_duplicate_update()
                        .map(<[String]>::to_vec),
                }
            }
            FlushAction::Update => Statement::Update {
                table,
                id: self.id,
                assignments: self.assignments(),
            },
            FlushAction::Delete => Statement::Delete {
                table,
                ids: vec![self.id],
            },
        }
    }

    /// Column list and values of an insert, `ID` first when explicit
    pub fn insert_row(&self) -> (Vec<String>, Row) {
        let mut columns = Vec::with_capacity(self.after.len() + 1);
        let mut row = Vec::with_capacity(self.after.len() + 1);
        if self.explicit_id {
            columns.push(crate::schema::ID_COLUMN.to_string());
            row.push(Value::UInt(self.id));
        }
        columns.extend(self.schema.data_columns().iter().map(|c| c.name.clone()));
        row.extend(self.after.iter().cloned());
        (columns, row)
    }

    /// Changed columns as JSON, keyed by column, for log events
    pub fn log_values(&self, row: &Row) -> BTreeMap<String, serde_json::Value> {
        let columns = self.schema.data_columns();
        let names: Vec<String> = match self.action {
            FlushAction::Update => self.changed(),
            _ => columns.iter().map(|c| c.name.clone()).collect(),
        };
        names
            .into_iter()
            .filter_map(|name| {
                let p = self.schema.row_position(&name)?;
                Some((name, columns[p].encode(&row[p])))
            })
            .collect()
    }
}

/// Plan the operation for one entity, `None` when it is clean.
pub(crate) fn plan_op(
    schema: &Arc<EntitySchema>,
    entity: &dyn Entity,
    target: Target,
) -> Result<Option<FlushOp>> {
    let state = entity.state();
    let id = entity.id();
    let mark = state.delete_mark();

    if mark != DeleteMark::None {
        if !state.is_loaded() || id == 0 {
            return Err(Error::NotLoaded {
                entity: schema.entity().to_string(),
                id,
                operation: "deleted",
            });
        }
        let before = state.snapshot().cloned();
        let snapshot = before.clone().unwrap_or_default();

        if let (Some(column), DeleteMark::Delete) = (schema.soft_delete(), mark) {
            let p = schema
                .row_position(column)
                .ok_or_else(|| Error::Internal(format!("missing soft-delete column {}", column)))?;
            let mut after = schema.normalize_row(id, entity.column_values())?;
            after[p] = Value::UInt(id);
            let bind = changed_bind(schema, &snapshot, &after);
            return Ok(Some(FlushOp {
                schema: Arc::clone(schema),
                action: FlushAction::Update,
                id,
                before,
                after,
                bind,
                target,
                soft_delete: true,
                explicit_id: false,
            }));
        }

        return Ok(Some(FlushOp {
            schema: Arc::clone(schema),
            action: FlushAction::Delete,
            id,
            before,
            after: snapshot,
            bind: Vec::new(),
            target,
            soft_delete: false,
            explicit_id: false,
        }));
    }

    let diff = row_diff(schema, entity)?;
    if !state.is_loaded() {
        let bind = diff.bind(schema);
        return Ok(Some(FlushOp {
            schema: Arc::clone(schema),
            action: FlushAction::Insert,
            id,
            before: None,
            after: diff.after,
            bind,
            target,
            soft_delete: false,
            explicit_id: id != 0,
        }));
    }

    if diff.changed.is_empty() {
        return Ok(None);
    }
    if id == 0 {
        return Err(Error::NotLoaded {
            entity: schema.entity().to_string(),
            id,
            operation: "updated",
        });
    }
    let bind = diff.bind(schema);
    Ok(Some(FlushOp {
        schema: Arc::clone(schema),
        action: FlushAction::Update,
        id,
        before: diff.before,
        after: diff.after,
        bind,
        target,
        soft_delete: false,
        explicit_id: false,
    }))
}

/// Delete operation for a row removed by a cascade
pub(crate) fn cascade_op(schema: &Arc<EntitySchema>, id: u64, row: Row) -> FlushOp {
    FlushOp {
        schema: Arc::clone(schema),
        action: FlushAction::Delete,
        id,
        before: Some(row.clone()),
        after: row,
        bind: Vec::new(),
        target: Target::Detached,
        soft_delete: false,
        explicit_id: false,
    }
}

fn changed_bind(schema: &EntitySchema, before: &Row, after: &Row) -> Vec<(String, Value)> {
    schema
        .data_columns()
        .iter()
        .zip(after)
        .enumerate()
        .filter(|(p, _)| before.get(*p) != after.get(*p))
        .map(|(_, (column, value))| (column.name.clone(), value.clone()))
        .collect()
}

//! Dirty-State Detector
//!
//! Compares the normalised column values of an entity with the snapshot
//! taken when it was last loaded or flushed. Normalisation happens per
//! column kind (see [`crate::schema::Column::normalize`]) so float noise
//! below the declared precision, `NULL` versus 0 references and bool versus
//! ID soft-delete markers never show up as changes.

use crate::entity::Entity;
use crate::error::Result;
use crate::schema::EntitySchema;
use crate::sql::{Assignment, Row};
use crate::value::Value;

/// Outcome of a dirty check
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyState {
    /// Whether the next flush writes anything
    pub is_dirty: bool,
    /// Changed columns with their new values in schema order.
    /// `None` for a pending delete or a clean entity.
    pub bind: Option<Vec<(String, Value)>>,
    /// Escaped `` `column` = literal `` fragments of the bind
    pub fragments: Option<Vec<String>>,
}

impl DirtyState {
    fn clean() -> Self {
        Self {
            is_dirty: false,
            bind: None,
            fragments: None,
        }
    }

    /// Names of the changed columns
    pub fn changed_columns(&self) -> Vec<&str> {
        self.bind
            .iter()
            .flatten()
            .map(|(column, _)| column.as_str())
            .collect()
    }
}

/// Row-level difference between an entity and its snapshot
#[derive(Debug, Clone)]
pub(crate) struct RowDiff {
    /// Snapshot of a loaded entity
    pub before: Option<Row>,
    /// Current normalised row
    pub after: Row,
    /// Changed data-row positions in schema order
    pub changed: Vec<usize>,
}

impl RowDiff {
    /// Changed columns with their new values
    pub fn bind(&self, schema: &EntitySchema) -> Vec<(String, Value)> {
        let columns = schema.data_columns();
        self.changed
            .iter()
            .map(|&p| (columns[p].name.clone(), self.after[p].clone()))
            .collect()
    }

    /// Names of the changed columns
    pub fn changed_names(&self, schema: &EntitySchema) -> Vec<String> {
        let columns = schema.data_columns();
        self.changed
            .iter()
            .map(|&p| columns[p].name.clone())
            .collect()
    }
}

/// Diff an entity against its snapshot, or against zero values when it was
/// never loaded.
pub(crate) fn row_diff(schema: &EntitySchema, entity: &dyn Entity) -> Result<RowDiff> {
    let after = schema.normalize_row(entity.id(), entity.column_values())?;
    let state = entity.state();
    let before = if state.is_loaded() {
        state.snapshot().cloned()
    } else {
        None
    };
    let changed = match &before {
        Some(snapshot) => after
            .iter()
            .enumerate()
            .filter(|(p, value)| snapshot.get(*p) != Some(*value))
            .map(|(p, _)| p)
            .collect(),
        None => schema
            .data_columns()
            .iter()
            .zip(&after)
            .enumerate()
            .filter(|(_, (column, value))| **value != column.zero())
            .map(|(p, _)| p)
            .collect(),
    };
    Ok(RowDiff {
        before,
        after,
        changed,
    })
}

/// Compute the dirty state of an entity.
pub fn compute_dirty(schema: &EntitySchema, entity: &dyn Entity) -> Result<DirtyState> {
    if entity.state().is_pending_delete() {
        return Ok(DirtyState {
            is_dirty: true,
            bind: None,
            fragments: None,
        });
    }
    let diff = row_diff(schema, entity)?;
    if diff.before.is_some() && diff.changed.is_empty() {
        return Ok(DirtyState::clean());
    }
    let bind = diff.bind(schema);
    let fragments = bind
        .iter()
        .map(|(column, value)| {
            Assignment {
                column: column.clone(),
                value: value.clone(),
            }
            .fragment()
        })
        .collect();
    Ok(DirtyState {
        is_dirty: true,
        bind: Some(bind),
        fragments: Some(fragments),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::entity::testing::{user_schema, User};
    use crate::entity::{Entity, EntityState, Reference};
    use crate::schema::{ColumnKind, EntitySchema, Precision};

    fn loaded_user(schema: &Arc<EntitySchema>) -> User {
        let mut user = User::new("Tom", 18);
        user.id = 5;
        let row = schema.normalize_row(5, user.column_values()).unwrap();
        user.state.mark_loaded(schema, row);
        user
    }

    #[test]
    fn test_new_entity_binds_non_zero_columns() {
        let schema = user_schema();
        let user = User::new("Tom", 0);
        let state = compute_dirty(&schema, &user).unwrap();
        assert!(state.is_dirty);
        assert_eq!(
            state.bind,
            Some(vec![("Name".to_string(), Value::from("Tom"))])
        );
        assert_eq!(state.fragments, Some(vec!["`Name` = 'Tom'".to_string()]));

        let empty = User::default();
        let state = compute_dirty(&schema, &empty).unwrap();
        assert!(state.is_dirty);
        assert_eq!(state.bind, Some(vec![]));
    }

    #[test]
    fn test_loaded_entity_clean_until_changed() {
        let schema = Arc::new(user_schema());
        let mut user = loaded_user(&schema);
        assert_eq!(compute_dirty(&schema, &user).unwrap(), DirtyState::clean());

        user.age = 19;
        let state = compute_dirty(&schema, &user).unwrap();
        assert!(state.is_dirty);
        assert_eq!(state.changed_columns(), vec!["Age"]);
        assert_eq!(state.fragments, Some(vec!["`Age` = 19".to_string()]));

        user.age = 18;
        assert!(!compute_dirty(&schema, &user).unwrap().is_dirty);
    }

    #[test]
    fn test_reference_changes() {
        let schema = Arc::new(user_schema());
        let mut user = loaded_user(&schema);

        user.friend = Reference::from_id(0);
        assert!(!compute_dirty(&schema, &user).unwrap().is_dirty);

        user.friend = Reference::from_id(7);
        let state = compute_dirty(&schema, &user).unwrap();
        assert_eq!(
            state.bind,
            Some(vec![("Friend".to_string(), Value::UInt(7))])
        );
    }

    #[test]
    fn test_soft_delete_marker_uses_own_id() {
        let schema = Arc::new(user_schema());
        let mut user = loaded_user(&schema);
        user.fake_delete = true;
        let state = compute_dirty(&schema, &user).unwrap();
        assert_eq!(
            state.bind,
            Some(vec![("FakeDelete".to_string(), Value::UInt(5))])
        );
    }

    #[test]
    fn test_pending_delete_short_circuits() {
        let schema = Arc::new(user_schema());
        let mut user = loaded_user(&schema);
        user.state.mark_to_delete();
        let state = compute_dirty(&schema, &user).unwrap();
        assert!(state.is_dirty);
        assert!(state.bind.is_none());
    }

    #[derive(Default)]
    struct Point {
        id: u64,
        x: f64,
        state: EntityState,
    }

    impl Entity for Point {
        fn entity_name(&self) -> &'static str {
            "Point"
        }
        fn id(&self) -> u64 {
            self.id
        }
        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
        fn state(&self) -> &EntityState {
            &self.state
        }
        fn state_mut(&mut self) -> &mut EntityState {
            &mut self.state
        }
        fn column_values(&self) -> Vec<Value> {
            vec![self.x.into()]
        }
        fn apply_column_values(&mut self, values: &[Value]) -> Result<()> {
            self.x = values[0].get("X")?;
            Ok(())
        }
    }

    #[test]
    fn test_float_noise_below_precision() {
        let schema = Arc::new(
            EntitySchema::builder("Point")
                .column(
                    "X",
                    ColumnKind::Float {
                        precision: Precision::Decimals(2),
                        wide: true,
                    },
                )
                .build()
                .unwrap(),
        );
        let mut point = Point {
            id: 1,
            x: 1.25,
            ..Default::default()
        };
        let row = schema.normalize_row(1, point.column_values()).unwrap();
        point.state.mark_loaded(&schema, row);

        point.x = 1.250_000_1;
        assert!(!compute_dirty(&schema, &point).unwrap().is_dirty);
        point.x = 1.26;
        assert!(compute_dirty(&schema, &point).unwrap().is_dirty);
    }
}

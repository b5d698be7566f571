//! Entity Model
//!
//! Application records implement [`Entity`] by hand: the trait exposes the
//! ID, the per-instance [`EntityState`], the column values in schema order
//! and the reference fields. Everything above this layer (dirty detection,
//! flush, resolver) works on rows of [`Value`]s and never needs reflection.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Default)]
//! struct User {
//!     id: u64,
//!     name: String,
//!     age: i64,
//!     state: EntityState,
//! }
//!
//! impl Entity for User {
//!     fn entity_name(&self) -> &'static str { "User" }
//!     fn id(&self) -> u64 { self.id }
//!     fn set_id(&mut self, id: u64) { self.id = id }
//!     fn state(&self) -> &EntityState { &self.state }
//!     fn state_mut(&mut self) -> &mut EntityState { &mut self.state }
//!     fn column_values(&self) -> Vec<Value> {
//!         vec![self.name.clone().into(), self.age.into()]
//!     }
//!     fn apply_column_values(&mut self, values: &[Value]) -> Result<()> {
//!         self.name = values[0].get("Name")?;
//!         self.age = values[1].get("Age")?;
//!         Ok(())
//!     }
//! }
//! ```

mod reference;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::schema::EntitySchema;
use crate::sql::Row;
use crate::value::Value;

pub use reference::{Reference, ReferenceList, ReferenceSlot};

/// Type-erased entity shared between reference holders
pub type SharedEntity = Arc<RwLock<dyn Entity>>;

/// Record type mapped to one table
pub trait Entity: Send + Sync + 'static {
    /// Registered entity name
    fn entity_name(&self) -> &'static str;

    /// Primary key, 0 while not persisted
    fn id(&self) -> u64;

    fn set_id(&mut self, id: u64);

    fn state(&self) -> &EntityState;

    fn state_mut(&mut self) -> &mut EntityState;

    /// Values of every data column in schema order (all columns but `ID`)
    fn column_values(&self) -> Vec<Value>;

    /// Assign data column values in schema order
    fn apply_column_values(&mut self, values: &[Value]) -> Result<()>;

    /// Reference fields by column name
    fn reference_slots(&self) -> Vec<(&'static str, &dyn ReferenceSlot)> {
        Vec::new()
    }

    /// Mutable reference fields by column name
    fn reference_slots_mut(&mut self) -> Vec<(&'static str, &mut dyn ReferenceSlot)> {
        Vec::new()
    }
}

/// Pending delete request on an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMark {
    #[default]
    None,
    /// Delete; entities with a soft-delete column are only marked deleted
    Delete,
    /// Delete the row even when a soft-delete column exists
    Force,
}

/// Per-instance persistence state
#[derive(Debug, Clone, Default)]
pub struct EntityState {
    snapshot: Option<Row>,
    loaded: bool,
    delete: DeleteMark,
    schema: Option<Arc<EntitySchema>>,
}

impl EntityState {
    /// Whether the entity was fetched from or written to storage
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether a delete is requested for the next flush
    pub fn is_pending_delete(&self) -> bool {
        self.delete != DeleteMark::None
    }

    pub fn delete_mark(&self) -> DeleteMark {
        self.delete
    }

    /// Column values as last loaded or flushed
    pub fn snapshot(&self) -> Option<&Row> {
        self.snapshot.as_ref()
    }

    /// Schema the entity is attached to
    pub fn schema(&self) -> Option<&Arc<EntitySchema>> {
        self.schema.as_ref()
    }

    /// Request deletion on the next flush
    pub fn mark_to_delete(&mut self) {
        self.delete = DeleteMark::Delete;
    }

    /// Request a hard delete on the next flush, bypassing soft delete
    pub fn force_mark_to_delete(&mut self) {
        self.delete = DeleteMark::Force;
    }

    /// Withdraw a pending delete
    pub fn cancel_delete(&mut self) {
        self.delete = DeleteMark::None;
    }

    pub(crate) fn mark_loaded(&mut self, schema: &Arc<EntitySchema>, row: Row) {
        self.schema = Some(Arc::clone(schema));
        self.snapshot = Some(row);
        self.loaded = true;
        self.delete = DeleteMark::None;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.snapshot = None;
        self.loaded = false;
        self.delete = DeleteMark::None;
    }
}

/// Registered name of an entity type
pub fn entity_name_of<T: Entity + Default>() -> &'static str {
    T::default().entity_name()
}

/// Build a loaded entity from a storage or cache row
pub(crate) fn materialize<T: Entity + Default>(
    schema: &Arc<EntitySchema>,
    id: u64,
    row: Row,
) -> Result<T> {
    let mut entity = T::default();
    entity.set_id(id);
    entity.apply_column_values(&row)?;
    entity.state_mut().mark_loaded(schema, row);
    Ok(entity)
}

/// Identity of a shared entity handle
#[inline]
pub(crate) fn handle_key(handle: &SharedEntity) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

#[cfg(test)]
pub(crate) mod testing {
    //! Small entities shared by unit tests across modules.

    use super::*;
    use crate::schema::{CachedQuery, ColumnKind, OnDelete};

    #[derive(Default)]
    pub struct User {
        pub id: u64,
        pub name: String,
        pub age: i64,
        pub friend: Reference<User>,
        pub fake_delete: bool,
        pub state: EntityState,
    }

    impl User {
        pub fn new(name: &str, age: i64) -> Self {
            Self {
                name: name.to_string(),
                age,
                ..Default::default()
            }
        }
    }

    impl Entity for User {
        fn entity_name(&self) -> &'static str {
            "User"
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
            vec![
                self.name.clone().into(),
                self.age.into(),
                self.friend.value(),
                self.fake_delete.into(),
            ]
        }
        fn apply_column_values(&mut self, values: &[Value]) -> Result<()> {
            self.name = values[0].get("Name")?;
            self.age = values[1].get("Age")?;
            self.friend.apply_value(&values[2], "Friend")?;
            self.fake_delete = values[3].get("FakeDelete")?;
            Ok(())
        }
        fn reference_slots(&self) -> Vec<(&'static str, &dyn ReferenceSlot)> {
            vec![("Friend", &self.friend)]
        }
        fn reference_slots_mut(&mut self) -> Vec<(&'static str, &mut dyn ReferenceSlot)> {
            vec![("Friend", &mut self.friend)]
        }
    }

    pub fn user_schema() -> EntitySchema {
        EntitySchema::builder("User")
            .column("Name", ColumnKind::Str)
            .column("Age", ColumnKind::Int)
            .reference_with("Friend", "User", OnDelete::Restrict)
            .soft_delete("FakeDelete")
            .local_cache("default")
            .shared_cache("default")
            .cached_query(CachedQuery::new("IndexAge").filter("Age"))
            .cached_query(CachedQuery::new("IndexAll"))
            .build()
            .expect("valid user schema")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{user_schema, User};
    use super::*;

    #[test]
    fn test_state_lifecycle() {
        let schema = Arc::new(user_schema());
        let mut state = EntityState::default();
        assert!(!state.is_loaded());
        assert!(state.snapshot().is_none());

        state.mark_loaded(&schema, vec![Value::from("Tom")]);
        assert!(state.is_loaded());
        assert_eq!(state.schema().map(|s| s.entity()), Some("User"));

        state.mark_to_delete();
        assert!(state.is_pending_delete());
        assert_eq!(state.delete_mark(), DeleteMark::Delete);
        state.cancel_delete();
        assert!(!state.is_pending_delete());

        state.force_mark_to_delete();
        state.mark_deleted();
        assert!(!state.is_loaded());
        assert!(!state.is_pending_delete());
    }

    #[test]
    fn test_materialize() {
        let schema = Arc::new(user_schema());
        let row = vec![
            Value::from("Tom"),
            Value::Int(18),
            Value::UInt(3),
            Value::UInt(0),
        ];
        let user: User = materialize(&schema, 7, row.clone()).unwrap();
        assert_eq!(user.id, 7);
        assert_eq!(user.age, 18);
        assert_eq!(user.friend.id(), Some(3));
        assert!(!user.fake_delete);
        assert_eq!(user.state.snapshot(), Some(&row));
        assert_eq!(entity_name_of::<User>(), "User");
    }

    #[test]
    fn test_shared_handle_identity() {
        let a: SharedEntity = Arc::new(RwLock::new(User::new("a", 1)));
        let b = Arc::clone(&a);
        let c: SharedEntity = Arc::new(RwLock::new(User::new("a", 1)));
        assert_eq!(handle_key(&a), handle_key(&b));
        assert_ne!(handle_key(&a), handle_key(&c));
    }
}

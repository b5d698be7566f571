//! Reference Fields
//!
//! A [`Reference`] stores the target ID and optionally a shared handle to
//! the target entity. Holding a handle to an unsaved target lets a flush
//! insert the target first and pick up its generated ID; warm-up fills the
//! handle from cache or storage.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::schema::EntitySchema;
use crate::sql::Row;
use crate::value::Value;

use super::{entity_name_of, materialize, Entity, SharedEntity};

/// Type-erased view of a reference field
pub trait ReferenceSlot: Send + Sync {
    /// Entity name of the referenced type
    fn target_entity(&self) -> &'static str;

    /// Referenced IDs, zero and absent entries skipped
    fn ids(&self) -> Vec<u64>;

    /// Attached targets that were never persisted
    fn unsaved_targets(&self) -> Vec<SharedEntity>;

    /// Attached targets
    fn targets(&self) -> Vec<SharedEntity>;

    /// Attach targets for referenced IDs found in `rows`
    fn hydrate(&mut self, schema: &Arc<EntitySchema>, rows: &HashMap<u64, Row>) -> Result<()>;
}

// =============================================================================
// Single Reference
// =============================================================================

/// Single reference to another entity
pub struct Reference<T: Entity + Default> {
    id: Option<u64>,
    target: Option<Arc<RwLock<T>>>,
}

impl<T: Entity + Default> Reference<T> {
    /// Empty reference
    pub fn new() -> Self {
        Self {
            id: None,
            target: None,
        }
    }

    /// Reference by ID only
    pub fn from_id(id: u64) -> Self {
        Self {
            id: (id != 0).then_some(id),
            target: None,
        }
    }

    /// Reference to an entity, taking ownership of it
    pub fn to(entity: T) -> Self {
        Self::from_shared(Arc::new(RwLock::new(entity)))
    }

    /// Reference to a shared entity handle
    pub fn from_shared(target: Arc<RwLock<T>>) -> Self {
        let id = target.try_read().map(|t| t.id()).filter(|id| *id != 0);
        Self {
            id,
            target: Some(target),
        }
    }

    /// Current target ID. Reads through to an attached target so IDs
    /// generated by a flush are visible immediately.
    pub fn id(&self) -> Option<u64> {
        match &self.target {
            Some(target) => match target.try_read() {
                Some(t) => Some(t.id()).filter(|id| *id != 0),
                None => self.id,
            },
            None => self.id,
        }
    }

    /// Column value of the reference
    pub fn value(&self) -> Value {
        self.id().map(Value::UInt).unwrap_or(Value::Null)
    }

    /// Point at another ID, dropping an attached target of a different ID
    pub fn set_id(&mut self, id: Option<u64>) {
        let id = id.filter(|id| *id != 0);
        if self.id() != id {
            self.target = None;
        }
        self.id = id;
    }

    /// Assign from a column value
    pub fn apply_value(&mut self, value: &Value, column: &str) -> Result<()> {
        let id: Option<u64> = value.get(column)?;
        self.set_id(id);
        Ok(())
    }

    /// Attached target handle
    pub fn target(&self) -> Option<&Arc<RwLock<T>>> {
        self.target.as_ref()
    }

    /// Whether a target is attached
    pub fn is_loaded(&self) -> bool {
        self.target.is_some()
    }

    /// Run a closure against the attached target
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.target.as_ref().map(|t| f(&t.read()))
    }

    /// Whether the reference points anywhere
    pub fn is_empty(&self) -> bool {
        self.id().is_none() && self.target.is_none()
    }
}

impl<T: Entity + Default> Default for Reference<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity + Default> Clone for Reference<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            target: self.target.clone(),
        }
    }
}

impl<T: Entity + Default> std::fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.id())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl<T: Entity + Default> ReferenceSlot for Reference<T> {
    fn target_entity(&self) -> &'static str {
        entity_name_of::<T>()
    }

    fn ids(&self) -> Vec<u64> {
        self.id().into_iter().collect()
    }

    fn unsaved_targets(&self) -> Vec<SharedEntity> {
        match &self.target {
            // a target locked by someone else is reported and rejected later
            Some(target) if target.try_read().map_or(true, |t| t.id() == 0) => {
                let shared: SharedEntity = target.clone();
                vec![shared]
            }
            _ => Vec::new(),
        }
    }

    fn targets(&self) -> Vec<SharedEntity> {
        self.target
            .iter()
            .map(|t| {
                let shared: SharedEntity = t.clone();
                shared
            })
            .collect()
    }

    fn hydrate(&mut self, schema: &Arc<EntitySchema>, rows: &HashMap<u64, Row>) -> Result<()> {
        let Some(id) = self.id() else {
            return Ok(());
        };
        if self.target.is_some() {
            return Ok(());
        }
        if let Some(row) = rows.get(&id) {
            let entity: T = materialize(schema, id, row.clone())?;
            self.target = Some(Arc::new(RwLock::new(entity)));
        }
        Ok(())
    }
}

// =============================================================================
// Reference Collection
// =============================================================================

/// Ordered collection of references stored as a JSON ID list
pub struct ReferenceList<T: Entity + Default> {
    items: Vec<Reference<T>>,
}

impl<T: Entity + Default> ReferenceList<T> {
    /// Empty collection
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Collection of IDs
    pub fn from_ids(ids: &[u64]) -> Self {
        Self {
            items: ids.iter().map(|id| Reference::from_id(*id)).collect(),
        }
    }

    /// Append a reference by ID
    pub fn push_id(&mut self, id: u64) {
        self.items.push(Reference::from_id(id));
    }

    /// Append a reference to an entity
    pub fn push(&mut self, entity: T) {
        self.items.push(Reference::to(entity));
    }

    /// Append a shared entity handle
    pub fn push_shared(&mut self, target: Arc<RwLock<T>>) {
        self.items.push(Reference::from_shared(target));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// References in order
    pub fn iter(&self) -> impl Iterator<Item = &Reference<T>> {
        self.items.iter()
    }

    /// Column value: JSON array of IDs, NULL when empty
    pub fn value(&self) -> Value {
        let ids = self.ids();
        if ids.is_empty() {
            Value::Null
        } else {
            Value::Json(Json::Array(ids.into_iter().map(Json::from).collect()))
        }
    }

    /// Replace the IDs, keeping attached targets whose IDs still match
    pub fn set_ids(&mut self, ids: &[u64]) {
        let mut previous: HashMap<u64, Reference<T>> = self
            .items
            .drain(..)
            .filter_map(|r| r.id().map(|id| (id, r)))
            .collect();
        self.items = ids
            .iter()
            .filter(|id| **id != 0)
            .map(|id| previous.remove(id).unwrap_or_else(|| Reference::from_id(*id)))
            .collect();
    }

    /// Assign from a column value
    pub fn apply_value(&mut self, value: &Value, column: &str) -> Result<()> {
        let ids = match value {
            Value::Null => Vec::new(),
            Value::Json(Json::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_u64().ok_or_else(|| Error::ValueType {
                        column: column.to_string(),
                        expected: "id list".into(),
                        got: item.to_string(),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(Error::ValueType {
                    column: column.to_string(),
                    expected: "id list".into(),
                    got: other.type_name().into(),
                })
            }
        };
        self.set_ids(&ids);
        Ok(())
    }
}

impl<T: Entity + Default> Default for ReferenceList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity + Default> Clone for ReferenceList<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: Entity + Default> std::fmt::Debug for ReferenceList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl<T: Entity + Default> ReferenceSlot for ReferenceList<T> {
    fn target_entity(&self) -> &'static str {
        entity_name_of::<T>()
    }

    fn ids(&self) -> Vec<u64> {
        self.items.iter().filter_map(Reference::id).collect()
    }

    fn unsaved_targets(&self) -> Vec<SharedEntity> {
        self.items.iter().flat_map(|r| r.unsaved_targets()).collect()
    }

    fn targets(&self) -> Vec<SharedEntity> {
        self.items.iter().flat_map(|r| r.targets()).collect()
    }

    fn hydrate(&mut self, schema: &Arc<EntitySchema>, rows: &HashMap<u64, Row>) -> Result<()> {
        for item in &mut self.items {
            item.hydrate(schema, rows)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{user_schema, User};
    use super::*;

    #[test]
    fn test_reference_reads_through_target() {
        let target = Arc::new(RwLock::new(User::new("a", 1)));
        let reference = Reference::from_shared(Arc::clone(&target));
        assert_eq!(reference.id(), None);
        assert_eq!(reference.value(), Value::Null);
        assert_eq!(reference.unsaved_targets().len(), 1);

        target.write().id = 9;
        assert_eq!(reference.id(), Some(9));
        assert_eq!(reference.value(), Value::UInt(9));
        assert!(reference.unsaved_targets().is_empty());
    }

    #[test]
    fn test_set_id_drops_stale_target() {
        let mut user = User::new("a", 1);
        user.id = 4;
        let mut reference = Reference::to(user);
        reference.set_id(Some(4));
        assert!(reference.is_loaded());
        reference.set_id(Some(5));
        assert!(!reference.is_loaded());
        reference.set_id(Some(0));
        assert!(reference.is_empty());
    }

    #[test]
    fn test_hydrate() {
        let schema = Arc::new(user_schema());
        let mut rows = HashMap::new();
        rows.insert(
            3,
            vec![
                Value::from("Ann"),
                Value::Int(30),
                Value::Null,
                Value::UInt(0),
            ],
        );
        let mut reference: Reference<User> = Reference::from_id(3);
        reference.hydrate(&schema, &rows).unwrap();
        assert_eq!(reference.with(|u| u.name.clone()), Some("Ann".to_string()));
        assert!(reference.with(|u| u.state.is_loaded()).unwrap_or(false));

        let mut missing: Reference<User> = Reference::from_id(8);
        missing.hydrate(&schema, &rows).unwrap();
        assert!(!missing.is_loaded());
    }

    #[test]
    fn test_reference_list_value() {
        let mut list: ReferenceList<User> = ReferenceList::from_ids(&[3, 1]);
        assert_eq!(list.value(), Value::Json(serde_json::json!([3, 1])));
        assert_eq!(list.target_entity(), "User");

        list.apply_value(&Value::Json(serde_json::json!([1, 2])), "Tags")
            .unwrap();
        assert_eq!(ReferenceSlot::ids(&list), vec![1, 2]);

        list.apply_value(&Value::Null, "Tags").unwrap();
        assert!(list.is_empty());
        assert_eq!(list.value(), Value::Null);
        assert!(list.apply_value(&Value::Int(1), "Tags").is_err());
    }
}

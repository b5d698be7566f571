//! Entity Schema Descriptor
//!
//! One immutable descriptor per entity type: table, pool, ordered columns,
//! cache-tier assignment, cached queries and event channels. Descriptors are
//! declared with [`EntitySchemaBuilder`] and validated once when built.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cache::key::{cache_prefix, point_key, search_key};
use crate::error::{Error, Result};
use crate::sql::Row;
use crate::value::Value;

use super::column::{Column, ColumnKind, OnDelete};
use super::query::CachedQuery;

/// Name of the primary key column, always at position 0
pub const ID_COLUMN: &str = "ID";

/// Invalidation channel notified on entity changes
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyChannel {
    pub name: String,
    /// Restrict update notifications to these columns; `None` means any column
    pub columns: Option<Vec<String>>,
}

impl DirtyChannel {
    /// Check whether an update of the given columns concerns this channel
    pub fn wants<'a>(&self, changed: impl IntoIterator<Item = &'a str>) -> bool {
        match &self.columns {
            None => true,
            Some(cols) => changed.into_iter().any(|c| cols.iter().any(|w| w == c)),
        }
    }
}

/// Persisted shape of one entity type
#[derive(Debug)]
pub struct EntitySchema {
    entity: String,
    table: String,
    pool: String,
    columns: Vec<Column>,
    positions: HashMap<String, usize>,
    cache_prefix: String,
    local_cache: Option<String>,
    shared_cache: Option<String>,
    cached_queries: BTreeMap<String, CachedQuery>,
    unique_indexes: BTreeMap<String, Vec<String>>,
    soft_delete: Option<String>,
    on_duplicate_update: Option<Vec<String>>,
    dirty_channels: Vec<DirtyChannel>,
    log_channel: Option<String>,
}

impl EntitySchema {
    /// Start declaring an entity
    pub fn builder(entity: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder::new(entity)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// All columns, `ID` first
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Columns carried in rows, snapshots and cache values (all but `ID`)
    pub fn data_columns(&self) -> &[Column] {
        &self.columns[1..]
    }

    /// All column names, `ID` first
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Position of a column in the full column list
    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    /// Position of a column within a data row
    pub fn row_position(&self, column: &str) -> Option<usize> {
        self.position(column).and_then(|p| p.checked_sub(1))
    }

    pub fn cache_prefix(&self) -> &str {
        &self.cache_prefix
    }

    pub fn local_cache(&self) -> Option<&str> {
        self.local_cache.as_deref()
    }

    pub fn shared_cache(&self) -> Option<&str> {
        self.shared_cache.as_deref()
    }

    /// Whether any cache tier is assigned
    pub fn has_cache(&self) -> bool {
        self.local_cache.is_some() || self.shared_cache.is_some()
    }

    pub fn cached_queries(&self) -> impl Iterator<Item = &CachedQuery> {
        self.cached_queries.values()
    }

    /// Look up a declared cached query
    pub fn cached_query(&self, name: &str) -> Result<&CachedQuery> {
        self.cached_queries
            .get(name)
            .ok_or_else(|| Error::UnknownIndex {
                entity: self.entity.clone(),
                index: name.to_string(),
            })
    }

    pub fn unique_indexes(&self) -> &BTreeMap<String, Vec<String>> {
        &self.unique_indexes
    }

    pub fn soft_delete(&self) -> Option<&str> {
        self.soft_delete.as_deref()
    }

    /// Columns refreshed when an insert hits a unique-key conflict
    pub fn on_duplicate_update(&self) -> Option<&[String]> {
        self.on_duplicate_update.as_deref()
    }

    pub fn dirty_channels(&self) -> &[DirtyChannel] {
        &self.dirty_channels
    }

    pub fn log_channel(&self) -> Option<&str> {
        self.log_channel.as_deref()
    }

    /// Single-reference columns with their target and delete behaviour
    pub fn references(&self) -> impl Iterator<Item = (&str, &str, OnDelete)> {
        self.columns.iter().filter_map(|c| match &c.kind {
            ColumnKind::Reference { target, on_delete } => {
                Some((c.name.as_str(), target.as_str(), *on_delete))
            }
            _ => None,
        })
    }

    /// Point-lookup cache key of a row
    pub fn point_key(&self, id: u64) -> String {
        point_key(&self.cache_prefix, id)
    }

    /// Normalise entity column values into a canonical data row.
    pub fn normalize_row(&self, id: u64, values: Vec<Value>) -> Result<Row> {
        let columns = self.data_columns();
        if values.len() != columns.len() {
            return Err(Error::InvalidSchema {
                entity: self.entity.clone(),
                reason: format!(
                    "expected {} column values, got {}",
                    columns.len(),
                    values.len()
                ),
            });
        }
        columns
            .iter()
            .zip(values)
            .map(|(column, value)| column.normalize(value, id))
            .collect()
    }

    /// Validate and normalise caller parameters of a cached query
    pub fn normalize_params(&self, query: &CachedQuery, params: &[Value]) -> Result<Vec<Value>> {
        if params.len() != query.fields.len() {
            return Err(Error::ParameterCount {
                index: query.name.clone(),
                expected: query.fields.len(),
                got: params.len(),
            });
        }
        query
            .fields
            .iter()
            .zip(params)
            .map(|(field, value)| match self.column(field) {
                Some(column) => column.normalize(value.clone(), 0),
                None => Ok(value.clone()),
            })
            .collect()
    }

    /// Extract the bound parameters of a cached query from a data row
    pub fn params_from_row(&self, query: &CachedQuery, row: &Row) -> Vec<Value> {
        query
            .fields
            .iter()
            .map(|field| {
                self.row_position(field)
                    .and_then(|p| row.get(p).cloned())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Search cache key for already-normalised parameters
    pub fn search_key(&self, query: &CachedQuery, params: &[Value]) -> String {
        search_key(&self.cache_prefix, &query.name, params)
    }

    fn column(&self, name: &str) -> Option<&Column> {
        self.position(name).map(|p| &self.columns[p])
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Declarative builder for [`EntitySchema`]
#[derive(Debug, Clone)]
pub struct EntitySchemaBuilder {
    entity: String,
    table: Option<String>,
    pool: String,
    columns: Vec<Column>,
    local_cache: Option<String>,
    shared_cache: Option<String>,
    cached_queries: Vec<CachedQuery>,
    unique_indexes: Vec<(String, Vec<String>)>,
    soft_delete: Option<String>,
    on_duplicate_update: Option<Vec<String>>,
    dirty_channels: Vec<DirtyChannel>,
    log_channel: Option<String>,
}

impl EntitySchemaBuilder {
    fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: None,
            pool: "default".to_string(),
            columns: Vec::new(),
            local_cache: None,
            shared_cache: None,
            cached_queries: Vec::new(),
            unique_indexes: Vec::new(),
            soft_delete: None,
            on_duplicate_update: None,
            dirty_channels: Vec::new(),
            log_channel: None,
        }
    }

    /// Table name (defaults to the entity name)
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Storage pool (defaults to `default`)
    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// Append a column
    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(Column::new(name, kind));
        self
    }

    /// Append a nullable column
    pub fn nullable(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(Column::new(name, kind).nullable());
        self
    }

    /// Flatten an embedded struct into columns prefixed with `prefix`
    pub fn embedded(mut self, prefix: &str, columns: Vec<Column>) -> Self {
        for mut column in columns {
            column.name = format!("{}{}", prefix, column.name);
            self.columns.push(column);
        }
        self
    }

    /// Single reference with restrict-on-delete
    pub fn reference(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.reference_with(name, target, OnDelete::Restrict)
    }

    /// Single reference with explicit delete behaviour
    pub fn reference_with(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        on_delete: OnDelete,
    ) -> Self {
        self.columns.push(Column::new(
            name,
            ColumnKind::Reference {
                target: target.into(),
                on_delete,
            },
        ));
        self
    }

    /// Reference collection stored as an ordered ID list
    pub fn reference_list(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.columns.push(Column::new(
            name,
            ColumnKind::ReferenceList {
                target: target.into(),
            },
        ));
        self
    }

    /// Soft-delete column
    pub fn soft_delete(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.columns
            .push(Column::new(name.clone(), ColumnKind::SoftDelete));
        self.soft_delete = Some(name);
        self
    }

    /// Cache rows in a process-local tier
    pub fn local_cache(mut self, pool: impl Into<String>) -> Self {
        self.local_cache = Some(pool.into());
        self
    }

    /// Cache rows in a shared tier
    pub fn shared_cache(mut self, pool: impl Into<String>) -> Self {
        self.shared_cache = Some(pool.into());
        self
    }

    /// Declare a cached query
    pub fn cached_query(mut self, query: CachedQuery) -> Self {
        self.cached_queries.push(query);
        self
    }

    /// Declare a unique index
    pub fn unique_index(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.unique_indexes.push((
            name.into(),
            columns.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    /// Insert as an upsert refreshing these columns on unique-key conflicts
    pub fn on_duplicate_key_update(mut self, columns: &[&str]) -> Self {
        self.on_duplicate_update = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Notify a dirty channel on every change
    pub fn dirty_channel(mut self, name: impl Into<String>) -> Self {
        self.dirty_channels.push(DirtyChannel {
            name: name.into(),
            columns: None,
        });
        self
    }

    /// Notify a dirty channel when one of these columns changes
    pub fn dirty_channel_on(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.dirty_channels.push(DirtyChannel {
            name: name.into(),
            columns: Some(columns.iter().map(|c| c.to_string()).collect()),
        });
        self
    }

    /// Publish a change log entry for every flushed row
    pub fn log_channel(mut self, name: impl Into<String>) -> Self {
        self.log_channel = Some(name.into());
        self
    }

    /// Validate the declaration and build the descriptor
    pub fn build(self) -> Result<EntitySchema> {
        let entity = self.entity;
        let invalid = |reason: String| Error::InvalidSchema {
            entity: entity.clone(),
            reason,
        };

        if entity.is_empty() {
            return Err(invalid("entity name is empty".into()));
        }

        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.push(Column::new(ID_COLUMN, ColumnKind::UInt));
        columns.extend(self.columns);

        let mut positions = HashMap::with_capacity(columns.len());
        for (pos, column) in columns.iter().enumerate() {
            if column.name.is_empty() {
                return Err(invalid(format!("column {} has no name", pos)));
            }
            if positions.insert(column.name.clone(), pos).is_some() {
                return Err(invalid(format!("duplicated column '{}'", column.name)));
            }
        }
        let known = |name: &str| positions.contains_key(name);

        let soft_deletes = columns
            .iter()
            .filter(|c| c.kind == ColumnKind::SoftDelete)
            .count();
        if soft_deletes > 1 {
            return Err(invalid("more than one soft-delete column".into()));
        }

        let mut cached_queries = BTreeMap::new();
        for query in self.cached_queries {
            if query.max == 0 {
                return Err(invalid(format!("cached query '{}' has max 0", query.name)));
            }
            let referenced = query
                .fields
                .iter()
                .chain(query.order_by.iter().map(|(c, _)| c));
            for column in referenced {
                if !known(column) {
                    return Err(invalid(format!(
                        "cached query '{}' uses unknown column '{}'",
                        query.name, column
                    )));
                }
            }
            let name = query.name.clone();
            if cached_queries.insert(name.clone(), query).is_some() {
                return Err(invalid(format!("duplicated cached query '{}'", name)));
            }
        }

        let mut unique_indexes = BTreeMap::new();
        for (name, cols) in self.unique_indexes {
            if cols.is_empty() {
                return Err(invalid(format!("unique index '{}' has no columns", name)));
            }
            if let Some(missing) = cols.iter().find(|c| !known(c)) {
                return Err(invalid(format!(
                    "unique index '{}' uses unknown column '{}'",
                    name, missing
                )));
            }
            unique_indexes.insert(name, cols);
        }

        if let Some(cols) = &self.on_duplicate_update {
            if unique_indexes.is_empty() {
                return Err(invalid("upsert requires a unique index".into()));
            }
            if let Some(missing) = cols.iter().find(|c| !known(c)) {
                return Err(invalid(format!("upsert uses unknown column '{}'", missing)));
            }
        }

        for channel in &self.dirty_channels {
            if let Some(missing) = channel.columns.iter().flatten().find(|c| !known(c)) {
                return Err(invalid(format!(
                    "dirty channel '{}' uses unknown column '{}'",
                    channel.name, missing
                )));
            }
        }

        let table = self.table.unwrap_or_else(|| entity.clone());
        let shape = columns
            .iter()
            .map(|c| format!("{}:{}:{}", c.name, c.kind.tag(), c.nullable))
            .collect::<Vec<_>>()
            .join(",");
        let prefix = cache_prefix(&self.pool, &table, &shape);

        let mut seen_channels = HashSet::new();
        let dirty_channels = self
            .dirty_channels
            .into_iter()
            .filter(|c| seen_channels.insert(c.name.clone()))
            .collect();

        Ok(EntitySchema {
            entity,
            table,
            pool: self.pool,
            columns,
            positions,
            cache_prefix: prefix,
            local_cache: self.local_cache,
            shared_cache: self.shared_cache,
            cached_queries,
            unique_indexes,
            soft_delete: self.soft_delete,
            on_duplicate_update: self.on_duplicate_update,
            dirty_channels,
            log_channel: self.log_channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn user_schema() -> EntitySchema {
        EntitySchema::builder("User")
            .column("Name", ColumnKind::Str)
            .column("Age", ColumnKind::Int)
            .embedded(
                "Address",
                vec![
                    Column::new("City", ColumnKind::Str),
                    Column::new("Zip", ColumnKind::Str),
                ],
            )
            .reference("Friend", "User")
            .soft_delete("FakeDelete")
            .local_cache("default")
            .cached_query(CachedQuery::new("IndexAge").filter("Age"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_column_layout() {
        let schema = user_schema();
        assert_eq!(
            schema.column_names(),
            vec!["ID", "Name", "Age", "AddressCity", "AddressZip", "Friend", "FakeDelete"]
        );
        assert_eq!(schema.position("ID"), Some(0));
        assert_eq!(schema.row_position("Age"), Some(1));
        assert_eq!(schema.row_position("ID"), None);
        assert_eq!(schema.table(), "User");
        assert_eq!(schema.soft_delete(), Some("FakeDelete"));
        assert_eq!(schema.references().count(), 1);
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let result = EntitySchema::builder("User")
            .column("Name", ColumnKind::Str)
            .column("Name", ColumnKind::Str)
            .build();
        assert_matches!(result, Err(Error::InvalidSchema { .. }));

        let result = EntitySchema::builder("User")
            .column("ID", ColumnKind::UInt)
            .build();
        assert_matches!(result, Err(Error::InvalidSchema { .. }));
    }

    #[test]
    fn test_cached_query_validation() {
        let result = EntitySchema::builder("User")
            .column("Name", ColumnKind::Str)
            .cached_query(CachedQuery::new("IndexAge").filter("Age"))
            .build();
        assert_matches!(result, Err(Error::InvalidSchema { .. }));

        let schema = user_schema();
        assert!(schema.cached_query("IndexAge").is_ok());
        assert_matches!(
            schema.cached_query("Missing"),
            Err(Error::UnknownIndex { .. })
        );
    }

    #[test]
    fn test_upsert_requires_unique_index() {
        let result = EntitySchema::builder("User")
            .column("Email", ColumnKind::Str)
            .on_duplicate_key_update(&["Email"])
            .build();
        assert_matches!(result, Err(Error::InvalidSchema { .. }));
    }

    #[test]
    fn test_normalize_row_and_params() {
        let schema = user_schema();
        let row = schema
            .normalize_row(
                3,
                vec![
                    Value::from("Tom"),
                    Value::Int(18),
                    Value::from("Berlin"),
                    Value::from("10115"),
                    Value::UInt(0),
                    Value::Bool(false),
                ],
            )
            .unwrap();
        assert_eq!(row[4], Value::Null);
        assert_eq!(row[5], Value::UInt(0));

        let query = schema.cached_query("IndexAge").unwrap();
        assert_eq!(schema.params_from_row(query, &row), vec![Value::Int(18)]);
        let params = schema.normalize_params(query, &[Value::UInt(18)]).unwrap();
        assert_eq!(params, vec![Value::Int(18)]);
        assert_eq!(
            schema.search_key(query, &params),
            schema.search_key(query, &[Value::Int(18)])
        );

        assert_matches!(
            schema.normalize_params(query, &[]),
            Err(Error::ParameterCount { expected: 1, got: 0, .. })
        );
        assert_matches!(
            schema.normalize_row(3, vec![]),
            Err(Error::InvalidSchema { .. })
        );
    }

    #[test]
    fn test_dirty_channel_filter() {
        let channel = DirtyChannel {
            name: "age_changed".into(),
            columns: Some(vec!["Age".into()]),
        };
        assert!(channel.wants(["Name", "Age"]));
        assert!(!channel.wants(["Name"]));
    }
}

//! In-Memory Storage
//!
//! Interprets structured [`Statement`]s and [`Query`]s against in-process
//! tables with MySQL-like semantics: auto-increment with a configurable
//! step, unique indexes, `ON DUPLICATE KEY UPDATE` affected-row counts and
//! transactions. Used by tests and the demo.
//!
//! Every statement is atomic: it runs against a copy of the table and the
//! copy replaces the table only when the statement succeeds. A batch stops
//! at its first failing statement. Transactions work on a private copy of
//! the tables, so nothing they write is visible before the commit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::ports::{BatchResult, Storage, Transaction};
use crate::error::{Error, Result};
use crate::schema::{EntitySchema, ID_COLUMN};
use crate::sql::{ExecResult, Filter, Query, Row, Select, SortOrder, Statement};
use crate::value::Value;

/// One table: full rows (`ID` first) by ID
#[derive(Debug, Clone)]
struct Table {
    name: String,
    positions: HashMap<String, usize>,
    defaults: Vec<Value>,
    unique: Vec<(String, Vec<usize>)>,
    rows: BTreeMap<u64, Row>,
    next_id: u64,
}

impl Table {
    fn from_schema(schema: &EntitySchema) -> Self {
        let positions = schema
            .column_names()
            .into_iter()
            .enumerate()
            .map(|(p, c)| (c, p))
            .collect::<HashMap<_, _>>();
        let defaults = schema.columns().iter().map(|c| c.zero()).collect();
        let unique = schema
            .unique_indexes()
            .iter()
            .map(|(name, cols)| {
                let positions = cols.iter().filter_map(|c| positions.get(c).copied()).collect();
                (name.clone(), positions)
            })
            .collect();
        Self {
            name: schema.table().to_string(),
            positions,
            defaults,
            unique,
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn position(&self, column: &str) -> std::result::Result<usize, String> {
        self.positions
            .get(column)
            .copied()
            .ok_or_else(|| format!("unknown column '{}' in table '{}'", column, self.name))
    }

    /// Unique index violated by `row`, ignoring the row with id `skip`
    fn conflict(&self, row: &Row, skip: u64) -> Option<(&str, u64)> {
        for (name, positions) in &self.unique {
            if positions.iter().any(|p| row[*p].is_null()) {
                continue;
            }
            let hit = self.rows.iter().find(|(id, existing)| {
                **id != skip && positions.iter().all(|p| existing[*p].matches(&row[*p]))
            });
            if let Some((id, _)) = hit {
                return Some((name.as_str(), *id));
            }
        }
        None
    }

    fn matches(&self, row: &Row, filters: &[Filter]) -> std::result::Result<bool, String> {
        for filter in filters {
            let id = row[0].as_id().unwrap_or(0);
            let ok = match filter {
                Filter::IdEq(v) => id == *v,
                Filter::IdIn(ids) => ids.contains(&id),
                Filter::IdNotIn(ids) => !ids.contains(&id),
                Filter::IdGt(v) => id > *v,
                Filter::Eq(column, Value::Null) => {
                    row[self.position(column)?].is_null()
                }
                Filter::Eq(column, value) => row[self.position(column)?].matches(value),
                Filter::In(column, values) => {
                    let current = &row[self.position(column)?];
                    values.iter().any(|v| current.matches(v))
                }
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Default)]
struct Tables(HashMap<String, Table>);

impl Tables {
    fn table(&self, pool: &str, name: &str) -> Result<&Table> {
        self.0
            .get(name)
            .ok_or_else(|| Error::storage(pool, format!("table '{}' doesn't exist", name)))
    }

    fn apply(&mut self, pool: &str, step: u64, statement: &Statement) -> Result<ExecResult> {
        let name = statement.table();
        let mut copy = self.table(pool, name)?.clone();
        let wrap = |e: String| Error::storage(pool, e);
        let result = match statement {
            Statement::Insert {
                columns,
                rows,
                on_duplicate_update,
                ..
            } => copy.insert(pool, step, columns, rows, on_duplicate_update.as_deref())?,
            Statement::Update {
                id, assignments, ..
            } => {
                let mut changed = false;
                if let Some(existing) = copy.rows.get(id).cloned() {
                    let mut row = existing.clone();
                    for assignment in assignments {
                        let p = copy.position(&assignment.column).map_err(wrap)?;
                        row[p] = assignment.value.clone();
                    }
                    if let Some((index, other)) = copy.conflict(&row, *id) {
                        return Err(duplicated(index, other));
                    }
                    changed = row != existing;
                    copy.rows.insert(*id, row);
                }
                ExecResult::new(u64::from(changed), 0)
            }
            Statement::Delete { ids, .. } => {
                let removed = ids.iter().filter(|id| copy.rows.remove(id).is_some()).count();
                ExecResult::new(removed as u64, 0)
            }
        };
        self.0.insert(name.to_string(), copy);
        Ok(result)
    }

    fn query(&self, pool: &str, query: &Query) -> Result<Vec<Row>> {
        match query {
            Query::Select(select) => self.select(pool, select),
            Query::Count { table, filters } => {
                Ok(vec![vec![Value::UInt(self.count(pool, table, filters)?)]])
            }
        }
    }

    fn select(&self, pool: &str, select: &Select) -> Result<Vec<Row>> {
        let table = self.table(pool, &select.table)?;
        let wrap = |e: String| Error::storage(pool, e);

        let projection = select
            .columns
            .iter()
            .map(|c| table.position(c))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(wrap)?;
        let order = select
            .order_by
            .iter()
            .map(|(c, o)| table.position(c).map(|p| (p, *o)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(wrap)?;

        let mut matched = Vec::new();
        for row in table.rows.values() {
            if table.matches(row, &select.filters).map_err(wrap)? {
                matched.push(row);
            }
        }
        if !order.is_empty() {
            matched.sort_by(|a, b| {
                for (p, direction) in &order {
                    let ordering = a[*p].compare(&b[*p]);
                    let ordering = match direction {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    };
                    if ordering != std::cmp::Ordering::Equal {
                        return ordering;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        let (offset, limit) = select.limit.unwrap_or((0, usize::MAX));
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| projection.iter().map(|p| row[*p].clone()).collect())
            .collect())
    }

    fn count(&self, pool: &str, table_name: &str, filters: &[Filter]) -> Result<u64> {
        let table = self.table(pool, table_name)?;
        let mut count = 0;
        for row in table.rows.values() {
            if table
                .matches(row, filters)
                .map_err(|e| Error::storage(pool, e))?
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Fold the rows a transaction changed since `base` into `self`.
    ///
    /// Fails without touching `self` when another writer changed one of the
    /// same rows or the merged rows violate a unique index.
    fn merge(&mut self, pool: &str, base: &Tables, working: &Tables) -> Result<()> {
        let mut merged = self.clone();
        let mut written = Vec::new();
        for (name, changed) in &working.0 {
            let before = base.0.get(name);
            let Some(target) = merged.0.get_mut(name) else {
                continue;
            };
            let ids: BTreeSet<u64> = changed
                .rows
                .keys()
                .chain(before.into_iter().flat_map(|t| t.rows.keys()))
                .copied()
                .collect();
            for id in ids {
                let old = before.and_then(|t| t.rows.get(&id));
                let new = changed.rows.get(&id);
                if old == new {
                    continue;
                }
                if target.rows.get(&id) != old {
                    return Err(Error::storage(
                        pool,
                        format!("row {} of '{}' was changed by a concurrent write", id, name),
                    ));
                }
                match new {
                    Some(row) => {
                        target.rows.insert(id, row.clone());
                        written.push((name.clone(), id));
                    }
                    None => {
                        target.rows.remove(&id);
                    }
                }
            }
            target.next_id = target.next_id.max(changed.next_id);
        }
        for (name, id) in written {
            let Some(table) = merged.0.get(&name) else {
                continue;
            };
            if let Some(row) = table.rows.get(&id) {
                if let Some((index, other)) = table.conflict(row, id) {
                    return Err(duplicated(index, other));
                }
            }
        }
        *self = merged;
        Ok(())
    }
}

impl Table {
    fn insert(
        &mut self,
        pool: &str,
        step: u64,
        columns: &[String],
        rows: &[Row],
        on_duplicate_update: Option<&[String]>,
    ) -> Result<ExecResult> {
        let positions = columns
            .iter()
            .map(|c| self.position(c))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::storage(pool, e))?;
        let update_positions = on_duplicate_update
            .map(|cols| {
                cols.iter()
                    .map(|c| self.position(c))
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .transpose()
            .map_err(|e| Error::storage(pool, e))?;

        let mut affected = 0;
        let mut first_id = 0;
        for values in rows {
            if values.len() != positions.len() {
                return Err(Error::storage(pool, "column count doesn't match value count"));
            }
            let mut row = self.defaults.clone();
            for (p, value) in positions.iter().zip(values) {
                row[*p] = value.clone();
            }
            let explicit = row[0].as_id().filter(|id| *id != 0);

            let existing = match explicit.filter(|id| self.rows.contains_key(id)) {
                Some(id) => Some((ID_COLUMN, id)),
                None => self.conflict(&row, 0),
            };
            if let Some((index, existing_id)) = existing {
                let Some(update) = &update_positions else {
                    return Err(duplicated(index, existing_id));
                };
                let Some(current) = self.rows.get(&existing_id).cloned() else {
                    continue;
                };
                let mut updated = current.clone();
                for p in update {
                    updated[*p] = row[*p].clone();
                }
                if updated != current {
                    if let Some((index, other)) = self.conflict(&updated, existing_id) {
                        return Err(duplicated(index, other));
                    }
                    self.rows.insert(existing_id, updated);
                    affected += 2;
                }
                if first_id == 0 {
                    first_id = existing_id;
                }
                continue;
            }

            let id = match explicit {
                Some(id) => {
                    if id >= self.next_id {
                        self.next_id = id + step;
                    }
                    id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += step;
                    id
                }
            };
            row[0] = Value::UInt(id);
            self.rows.insert(id, row);
            affected += 1;
            if first_id == 0 {
                first_id = id;
            }
        }
        Ok(ExecResult::new(affected, first_id))
    }
}

fn duplicated(index: &str, existing: u64) -> Error {
    Error::DuplicatedKey {
        index: index.to_string(),
        message: format!("duplicate entry for row {}", existing),
    }
}

/// Call counters and SQL log shared by a pool and its transactions
#[derive(Default)]
struct Activity {
    statements: AtomicU64,
    round_trips: AtomicU64,
    queries: AtomicU64,
    open_transactions: AtomicU64,
    log: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl Activity {
    fn check(&self, pool: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::storage(pool, "server has gone away"))
        } else {
            Ok(())
        }
    }

    fn record(&self, pool: &str, sql: String) {
        debug!(pool = %pool, sql = %sql, "Storage call");
        self.log.lock().push(sql);
    }

    fn statement(&self, pool: &str, statement: &Statement) {
        self.statements.fetch_add(1, Ordering::Relaxed);
        self.record(pool, statement.sql().0);
    }

    fn query(&self, pool: &str, query: &Query) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.record(pool, query.sql().0);
    }
}

/// Run statements in order, stopping at the first failure
fn run_batch(
    pool: &str,
    activity: &Activity,
    statements: &[Statement],
    mut apply: impl FnMut(&Statement) -> Result<ExecResult>,
) -> BatchResult {
    let mut batch = BatchResult::default();
    for statement in statements {
        activity.statement(pool, statement);
        match apply(statement) {
            Ok(result) => batch.results.push(result),
            Err(e) => {
                batch.error = Some(e);
                break;
            }
        }
    }
    batch
}

/// In-memory storage pool
pub struct MemoryStorage {
    pool: String,
    auto_increment_step: u64,
    tables: Arc<Mutex<Tables>>,
    activity: Arc<Activity>,
}

impl MemoryStorage {
    /// Create an empty pool
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            auto_increment_step: 1,
            tables: Arc::new(Mutex::new(Tables::default())),
            activity: Arc::new(Activity::default()),
        }
    }

    /// Generate IDs `1, 1 + step, 1 + 2*step, ...`
    pub fn with_auto_increment_step(mut self, step: u64) -> Self {
        self.auto_increment_step = step.max(1);
        self
    }

    /// Make every following call fail until switched off
    pub fn set_failing(&self, failing: bool) {
        self.activity.failing.store(failing, Ordering::SeqCst);
    }

    /// Write statements executed, inside transactions or not
    pub fn statements(&self) -> u64 {
        self.activity.statements.load(Ordering::Relaxed)
    }

    /// Write round trips (a batch counts once)
    pub fn round_trips(&self) -> u64 {
        self.activity.round_trips.load(Ordering::Relaxed)
    }

    /// Queries executed
    pub fn queries(&self) -> u64 {
        self.activity.queries.load(Ordering::Relaxed)
    }

    /// Rendered SQL of every statement and query, oldest first
    pub fn executed_sql(&self) -> Vec<String> {
        self.activity.log.lock().clone()
    }

    /// Reset counters and the SQL log
    pub fn reset_counters(&self) {
        self.activity.statements.store(0, Ordering::Relaxed);
        self.activity.round_trips.store(0, Ordering::Relaxed);
        self.activity.queries.store(0, Ordering::Relaxed);
        self.activity.log.lock().clear();
    }

    /// Number of committed rows in a table
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .0
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Committed full row (`ID` first) by ID
    pub fn row(&self, table: &str, id: u64) -> Option<Row> {
        self.tables
            .lock()
            .0
            .get(table)
            .and_then(|t| t.rows.get(&id).cloned())
    }

    /// Transactions begun and not yet committed or rolled back
    pub fn open_transactions(&self) -> u64 {
        self.activity.open_transactions.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("pool", &self.pool)
            .field("auto_increment_step", &self.auto_increment_step)
            .field("tables", &self.tables.lock().0.len())
            .field("open_transactions", &self.open_transactions())
            .finish()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn pool(&self) -> &str {
        &self.pool
    }

    fn auto_increment_step(&self) -> u64 {
        self.auto_increment_step
    }

    fn register_table(&self, schema: &EntitySchema) {
        self.tables
            .lock()
            .0
            .entry(schema.table().to_string())
            .or_insert_with(|| Table::from_schema(schema));
    }

    async fn exec(&self, statement: &Statement) -> Result<ExecResult> {
        self.activity.check(&self.pool)?;
        self.activity.round_trips.fetch_add(1, Ordering::Relaxed);
        self.activity.statement(&self.pool, statement);
        self.tables
            .lock()
            .apply(&self.pool, self.auto_increment_step, statement)
    }

    async fn exec_batch(&self, statements: &[Statement]) -> BatchResult {
        if let Err(e) = self.activity.check(&self.pool) {
            return BatchResult {
                results: Vec::new(),
                error: Some(e),
            };
        }
        self.activity.round_trips.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.tables.lock();
        run_batch(&self.pool, &self.activity, statements, |statement| {
            tables.apply(&self.pool, self.auto_increment_step, statement)
        })
    }

    async fn query_rows(&self, query: &Query) -> Result<Vec<Row>> {
        self.activity.check(&self.pool)?;
        self.activity.query(&self.pool, query);
        self.tables.lock().query(&self.pool, query)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.activity.check(&self.pool)?;
        let base = self.tables.lock().clone();
        self.activity.record(&self.pool, "BEGIN".into());
        self.activity.open_transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            pool: self.pool.clone(),
            auto_increment_step: self.auto_increment_step,
            shared: Arc::clone(&self.tables),
            activity: Arc::clone(&self.activity),
            working: Mutex::new(base.clone()),
            base,
            finished: AtomicBool::new(false),
        }))
    }
}

/// Transaction over a private copy of the tables.
///
/// Commit folds the rows changed since `BEGIN` into the pool, failing when
/// another writer changed the same rows meanwhile. Lock order is `working`
/// before `shared`.
struct MemoryTransaction {
    pool: String,
    auto_increment_step: u64,
    shared: Arc<Mutex<Tables>>,
    activity: Arc<Activity>,
    /// Tables as of `BEGIN`
    base: Tables,
    working: Mutex<Tables>,
    finished: AtomicBool,
}

impl MemoryTransaction {
    fn check(&self) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(Error::storage(&self.pool, "transaction already finished"));
        }
        self.activity.check(&self.pool)
    }

    /// Apply a statement to the private tables. Auto-increment counters are
    /// not transactional: IDs are drawn from the pool and never handed out
    /// twice, even when the transaction rolls back.
    fn apply(&self, working: &mut Tables, statement: &Statement) -> Result<ExecResult> {
        let name = statement.table();
        let mut shared = self.shared.lock();
        if let (Some(table), Some(pool_table)) = (working.0.get_mut(name), shared.0.get(name)) {
            table.next_id = table.next_id.max(pool_table.next_id);
        }
        let result = working.apply(&self.pool, self.auto_increment_step, statement);
        if let (Some(table), Some(pool_table)) = (working.0.get(name), shared.0.get_mut(name)) {
            pool_table.next_id = pool_table.next_id.max(table.next_id);
        }
        result
    }

    fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(Error::storage(&self.pool, "transaction already finished"));
        }
        self.activity.open_transactions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.activity.open_transactions.fetch_sub(1, Ordering::SeqCst);
            debug!(pool = %self.pool, "Transaction dropped without commit");
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn pool(&self) -> &str {
        &self.pool
    }

    async fn exec(&self, statement: &Statement) -> Result<ExecResult> {
        self.check()?;
        self.activity.round_trips.fetch_add(1, Ordering::Relaxed);
        self.activity.statement(&self.pool, statement);
        let mut working = self.working.lock();
        self.apply(&mut working, statement)
    }

    async fn exec_batch(&self, statements: &[Statement]) -> BatchResult {
        if let Err(e) = self.check() {
            return BatchResult {
                results: Vec::new(),
                error: Some(e),
            };
        }
        self.activity.round_trips.fetch_add(1, Ordering::Relaxed);
        let mut working = self.working.lock();
        run_batch(&self.pool, &self.activity, statements, |statement| {
            self.apply(&mut working, statement)
        })
    }

    async fn query_rows(&self, query: &Query) -> Result<Vec<Row>> {
        self.check()?;
        self.activity.query(&self.pool, query);
        self.working.lock().query(&self.pool, query)
    }

    async fn commit(&self) -> Result<()> {
        self.check()?;
        self.finish()?;
        let working = self.working.lock();
        self.shared.lock().merge(&self.pool, &self.base, &working)?;
        self.activity.record(&self.pool, "COMMIT".into());
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.finish()?;
        self.activity.record(&self.pool, "ROLLBACK".into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnKind;
    use crate::sql::Assignment;
    use assert_matches::assert_matches;

    fn storage(step: u64) -> MemoryStorage {
        let storage = MemoryStorage::new("default").with_auto_increment_step(step);
        let schema = EntitySchema::builder("User")
            .column("Name", ColumnKind::Str)
            .column("Age", ColumnKind::Int)
            .unique_index("UniqueName", &["Name"])
            .build()
            .unwrap();
        storage.register_table(&schema);
        storage
    }

    fn insert(rows: Vec<(&str, i64)>, upsert: bool) -> Statement {
        Statement::Insert {
            table: "User".into(),
            columns: vec!["Name".into(), "Age".into()],
            rows: rows
                .into_iter()
                .map(|(n, a)| vec![Value::from(n), Value::Int(a)])
                .collect(),
            on_duplicate_update: upsert.then(|| vec!["Age".to_string()]),
        }
    }

    fn all_ids() -> Query {
        Query::Select(
            Select::new("User", vec!["ID".into()]).order_by("ID", SortOrder::Asc),
        )
    }

    #[tokio::test]
    async fn test_auto_increment_step() {
        let storage = storage(2);
        let result = storage
            .exec(&insert(vec![("a", 1), ("b", 2), ("c", 3)], false))
            .await
            .unwrap();
        assert_eq!(result, ExecResult::new(3, 1));
        let ids = storage.query_rows(&all_ids()).await.unwrap();
        assert_eq!(
            ids,
            vec![vec![Value::UInt(1)], vec![Value::UInt(3)], vec![Value::UInt(5)]]
        );
    }

    #[tokio::test]
    async fn test_duplicate_key_is_atomic() {
        let storage = storage(1);
        storage.exec(&insert(vec![("a", 1)], false)).await.unwrap();
        let err = storage
            .exec(&insert(vec![("b", 2), ("a", 3)], false))
            .await
            .unwrap_err();
        assert_matches!(err, Error::DuplicatedKey { index, .. } if index == "UniqueName");
        assert_eq!(storage.row_count("User"), 1);
    }

    #[tokio::test]
    async fn test_upsert_affected_rows() {
        let storage = storage(1);
        storage.exec(&insert(vec![("a", 1)], true)).await.unwrap();
        let updated = storage.exec(&insert(vec![("a", 5)], true)).await.unwrap();
        assert_eq!(updated.rows_affected, 2);
        let unchanged = storage.exec(&insert(vec![("a", 5)], true)).await.unwrap();
        assert_eq!(unchanged.rows_affected, 0);
        assert_eq!(
            storage.row("User", 1),
            Some(vec![Value::UInt(1), Value::from("a"), Value::Int(5)])
        );
    }

    #[tokio::test]
    async fn test_update_delete_and_filters() {
        let storage = storage(1);
        storage
            .exec(&insert(vec![("a", 10), ("b", 18), ("c", 10)], false))
            .await
            .unwrap();
        let update = Statement::Update {
            table: "User".into(),
            id: 2,
            assignments: vec![Assignment {
                column: "Age".into(),
                value: Value::Int(10),
            }],
        };
        assert_eq!(storage.exec(&update).await.unwrap().rows_affected, 1);
        assert_eq!(storage.exec(&update).await.unwrap().rows_affected, 0);

        let query = Query::Select(
            Select::new("User", vec!["ID".into()])
                .filter(Filter::Eq("Age".into(), Value::Int(10)))
                .order_by("ID", SortOrder::Desc)
                .limit(1, 5),
        );
        let rows = storage.query_rows(&query).await.unwrap();
        assert_eq!(rows, vec![vec![Value::UInt(2)], vec![Value::UInt(1)]]);

        let count = Query::Count {
            table: "User".into(),
            filters: vec![Filter::IdGt(1)],
        };
        assert_eq!(
            storage.query_row(&count).await.unwrap(),
            Some(vec![Value::UInt(2)])
        );

        let delete = Statement::Delete {
            table: "User".into(),
            ids: vec![1, 3, 99],
        };
        assert_eq!(storage.exec(&delete).await.unwrap().rows_affected, 2);
        assert_eq!(storage.row_count("User"), 1);
        assert_eq!(storage.statements(), 4);
        assert_eq!(storage.queries(), 2);
    }

    fn set_age(id: u64, age: i64) -> Statement {
        Statement::Update {
            table: "User".into(),
            id,
            assignments: vec![Assignment {
                column: "Age".into(),
                value: Value::Int(age),
            }],
        }
    }

    fn rename(id: u64, name: &str) -> Statement {
        Statement::Update {
            table: "User".into(),
            id,
            assignments: vec![Assignment {
                column: "Name".into(),
                value: Value::from(name),
            }],
        }
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_failure() {
        let storage = storage(1);
        storage
            .exec(&insert(vec![("a", 1), ("b", 2)], false))
            .await
            .unwrap();
        let batch = storage
            .exec_batch(&[set_age(1, 9), rename(2, "a"), set_age(2, 7)])
            .await;
        assert_eq!(batch.applied(), 1);
        assert_matches!(batch.error, Some(Error::DuplicatedKey { .. }));
        assert_eq!(storage.row("User", 1).unwrap()[2], Value::Int(9));
        assert_eq!(storage.row("User", 2).unwrap()[2], Value::Int(2));
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let storage = storage(1);
        let transaction = storage.begin().await.unwrap();
        assert_eq!(storage.open_transactions(), 1);
        transaction
            .exec(&insert(vec![("a", 1)], false))
            .await
            .unwrap();
        assert_eq!(transaction.query_rows(&all_ids()).await.unwrap().len(), 1);
        assert_eq!(storage.row_count("User"), 0);

        transaction.rollback().await.unwrap();
        assert_eq!(storage.row_count("User"), 0);
        assert_eq!(storage.open_transactions(), 0);
        assert!(transaction.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_transactions_are_isolated() {
        let storage = storage(1);
        storage.exec(&insert(vec![("a", 1)], false)).await.unwrap();
        let first = storage.begin().await.unwrap();
        let second = storage.begin().await.unwrap();

        first.exec(&set_age(1, 5)).await.unwrap();
        storage.exec(&insert(vec![("b", 2)], false)).await.unwrap();
        assert_eq!(second.query_rows(&all_ids()).await.unwrap().len(), 1);

        first.commit().await.unwrap();
        assert_eq!(storage.row_count("User"), 2);
        assert_eq!(storage.row("User", 1).unwrap()[2], Value::Int(5));

        // Same row changed by the committed transaction
        second.exec(&set_age(1, 6)).await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert_matches!(err, Error::Storage { .. });
        assert_eq!(storage.row("User", 1).unwrap()[2], Value::Int(5));
        assert_eq!(storage.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let storage = storage(1);
        {
            let transaction = storage.begin().await.unwrap();
            transaction
                .exec(&insert(vec![("a", 1)], false))
                .await
                .unwrap();
        }
        assert_eq!(storage.open_transactions(), 0);
        assert_eq!(storage.row_count("User"), 0);
    }

    #[tokio::test]
    async fn test_commit_checks_unique_indexes() {
        let storage = storage(1);
        let transaction = storage.begin().await.unwrap();
        transaction
            .exec(&insert(vec![("a", 1)], false))
            .await
            .unwrap();
        storage
            .exec(&Statement::Insert {
                table: "User".into(),
                columns: vec!["ID".into(), "Name".into(), "Age".into()],
                rows: vec![vec![Value::UInt(5), Value::from("a"), Value::Int(2)]],
                on_duplicate_update: None,
            })
            .await
            .unwrap();
        assert_matches!(
            transaction.commit().await,
            Err(Error::DuplicatedKey { index, .. }) if index == "UniqueName"
        );
        assert_eq!(storage.row_count("User"), 1);
        assert!(storage.row("User", 1).is_none());
    }

    #[tokio::test]
    async fn test_unknown_table_and_failure() {
        let storage = storage(1);
        let err = storage
            .exec(&Statement::Delete {
                table: "Nope".into(),
                ids: vec![1],
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::Storage { .. });

        storage.set_failing(true);
        assert_matches!(storage.query_rows(&all_ids()).await, Err(Error::Storage { .. }));
    }
}

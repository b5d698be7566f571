//! Structured Statements and Queries
//!
//! The engine never builds SQL strings ad hoc. Every write is a [`Statement`]
//! and every read a [`Query`]; both render to MySQL-flavoured SQL with
//! positional arguments for real drivers, and the in-memory storage adapter
//! interprets them directly.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Row of column values as returned by storage
pub type Row = Vec<Value>;

/// Outcome of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Number of rows affected (MySQL semantics: 2 for an upsert that updated)
    pub rows_affected: u64,
    /// First auto-generated ID of the statement, 0 when none
    pub last_insert_id: u64,
}

impl ExecResult {
    /// Create a new result
    pub fn new(rows_affected: u64, last_insert_id: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id,
        }
    }
}

/// Sort direction for ordered queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Single column assignment in an UPDATE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

impl Assignment {
    /// Render as an SQL fragment with an escaped literal
    pub fn fragment(&self) -> String {
        format!("`{}` = {}", self.column, self.value.sql_literal())
    }
}

// =============================================================================
// Statements
// =============================================================================

/// Write statement against one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Statement {
    /// Multi-row insert, optionally as an upsert
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Row>,
        /// Columns refreshed on a unique-key conflict
        on_duplicate_update: Option<Vec<String>>,
    },
    /// Update of changed columns for one row
    Update {
        table: String,
        id: u64,
        assignments: Vec<Assignment>,
    },
    /// Delete of a set of rows by ID
    Delete { table: String, ids: Vec<u64> },
}

impl Statement {
    /// Table the statement writes to
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    /// Render SQL text and positional arguments.
    ///
    /// UPDATE assignments are inlined as escaped literals so a batch of
    /// updates can travel as one multi-statement round trip.
    pub fn sql(&self) -> (String, Vec<Value>) {
        match self {
            Statement::Insert {
                table,
                columns,
                rows,
                on_duplicate_update,
            } => {
                let cols = columns
                    .iter()
                    .map(|c| format!("`{}`", c))
                    .collect::<Vec<_>>()
                    .join(",");
                let placeholder = format!("({})", vec!["?"; columns.len()].join(","));
                let values = vec![placeholder; rows.len()].join(",");
                let mut sql = format!("INSERT INTO `{}`({}) VALUES {}", table, cols, values);
                if let Some(update) = on_duplicate_update {
                    let sets = update
                        .iter()
                        .map(|c| format!("`{0}` = VALUES(`{0}`)", c))
                        .collect::<Vec<_>>()
                        .join(",");
                    sql.push_str(" ON DUPLICATE KEY UPDATE ");
                    sql.push_str(&sets);
                }
                let args = rows.iter().flatten().cloned().collect();
                (sql, args)
            }
            Statement::Update {
                table,
                id,
                assignments,
            } => {
                let sets = assignments
                    .iter()
                    .map(Assignment::fragment)
                    .collect::<Vec<_>>()
                    .join(",");
                (
                    format!("UPDATE `{}` SET {} WHERE `ID` = {}", table, sets, id),
                    Vec::new(),
                )
            }
            Statement::Delete { table, ids } => (
                format!("DELETE FROM `{}` WHERE `ID` IN ({})", table, join_ids(ids)),
                Vec::new(),
            ),
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Conjunctive filter condition
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    IdEq(u64),
    IdIn(Vec<u64>),
    IdNotIn(Vec<u64>),
    IdGt(u64),
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    fn render(&self, args: &mut Vec<Value>) -> String {
        match self {
            Filter::IdEq(id) => {
                args.push(Value::UInt(*id));
                "`ID` = ?".to_string()
            }
            Filter::IdIn(ids) => format!("`ID` IN ({})", join_ids(ids)),
            Filter::IdNotIn(ids) => format!("`ID` NOT IN ({})", join_ids(ids)),
            Filter::IdGt(id) => {
                args.push(Value::UInt(*id));
                "`ID` > ?".to_string()
            }
            Filter::Eq(column, Value::Null) => format!("`{}` IS NULL", column),
            Filter::Eq(column, value) => {
                args.push(value.clone());
                format!("`{}` = ?", column)
            }
            Filter::In(column, values) => {
                let marks = vec!["?"; values.len()].join(",");
                args.extend(values.iter().cloned());
                format!("`{}` IN ({})", column, marks)
            }
        }
    }
}

/// Row selection
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<(String, SortOrder)>,
    /// `(offset, limit)`
    pub limit: Option<(usize, usize)>,
}

impl Select {
    /// Select the given columns from a table
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Add a filter condition
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append an ordering column
    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push((column.into(), order));
        self
    }

    /// Restrict to a window of rows
    pub fn limit(mut self, offset: usize, limit: usize) -> Self {
        self.limit = Some((offset, limit));
        self
    }
}

/// Read query
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Select),
    Count { table: String, filters: Vec<Filter> },
}

impl Query {
    /// Table the query reads from
    pub fn table(&self) -> &str {
        match self {
            Query::Select(select) => &select.table,
            Query::Count { table, .. } => table,
        }
    }

    /// Render SQL text and positional arguments
    pub fn sql(&self) -> (String, Vec<Value>) {
        let mut args = Vec::new();
        match self {
            Query::Select(select) => {
                let cols = select
                    .columns
                    .iter()
                    .map(|c| format!("`{}`", c))
                    .collect::<Vec<_>>()
                    .join(",");
                let mut sql = format!("SELECT {} FROM `{}`", cols, select.table);
                sql.push_str(&render_where(&select.filters, &mut args));
                if !select.order_by.is_empty() {
                    let order = select
                        .order_by
                        .iter()
                        .map(|(c, o)| format!("`{}` {}", c, o.sql()))
                        .collect::<Vec<_>>()
                        .join(",");
                    sql.push_str(" ORDER BY ");
                    sql.push_str(&order);
                }
                if let Some((offset, limit)) = select.limit {
                    sql.push_str(&format!(" LIMIT {},{}", offset, limit));
                }
                (sql, args)
            }
            Query::Count { table, filters } => {
                let mut sql = format!("SELECT COUNT(1) FROM `{}`", table);
                sql.push_str(&render_where(filters, &mut args));
                (sql, args)
            }
        }
    }
}

fn render_where(filters: &[Filter], args: &mut Vec<Value>) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let clauses = filters
        .iter()
        .map(|f| f.render(args))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(" WHERE {}", clauses)
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sql() {
        let stmt = Statement::Insert {
            table: "User".into(),
            columns: vec!["Name".into(), "Age".into()],
            rows: vec![
                vec![Value::from("a"), Value::Int(10)],
                vec![Value::from("b"), Value::Int(18)],
            ],
            on_duplicate_update: None,
        };
        let (sql, args) = stmt.sql();
        assert_eq!(sql, "INSERT INTO `User`(`Name`,`Age`) VALUES (?,?),(?,?)");
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_upsert_sql() {
        let stmt = Statement::Insert {
            table: "User".into(),
            columns: vec!["Email".into(), "Age".into()],
            rows: vec![vec![Value::from("a@b"), Value::Int(1)]],
            on_duplicate_update: Some(vec!["Age".into()]),
        };
        let (sql, _) = stmt.sql();
        assert!(sql.ends_with("ON DUPLICATE KEY UPDATE `Age` = VALUES(`Age`)"));
    }

    #[test]
    fn test_update_inlines_escaped_literals() {
        let stmt = Statement::Update {
            table: "User".into(),
            id: 5,
            assignments: vec![
                Assignment {
                    column: "Name".into(),
                    value: Value::from("O'Brien"),
                },
                Assignment {
                    column: "Age".into(),
                    value: Value::Int(18),
                },
            ],
        };
        let (sql, args) = stmt.sql();
        assert_eq!(
            sql,
            "UPDATE `User` SET `Name` = 'O\\'Brien',`Age` = 18 WHERE `ID` = 5"
        );
        assert!(args.is_empty());
    }

    #[test]
    fn test_select_sql() {
        let query = Query::Select(
            Select::new("User", vec!["ID".into()])
                .filter(Filter::Eq("Age".into(), Value::Int(18)))
                .filter(Filter::Eq("FakeDelete".into(), Value::UInt(0)))
                .order_by("ID", SortOrder::Asc)
                .limit(1000, 2000),
        );
        let (sql, args) = query.sql();
        assert_eq!(
            sql,
            "SELECT `ID` FROM `User` WHERE `Age` = ? AND `FakeDelete` = ? ORDER BY `ID` ASC LIMIT 1000,2000"
        );
        assert_eq!(args, vec![Value::Int(18), Value::UInt(0)]);
    }

    #[test]
    fn test_count_and_delete_sql() {
        let (sql, _) = Query::Count {
            table: "User".into(),
            filters: vec![Filter::Eq("Name".into(), Value::Null)],
        }
        .sql();
        assert_eq!(sql, "SELECT COUNT(1) FROM `User` WHERE `Name` IS NULL");

        let (sql, _) = Statement::Delete {
            table: "User".into(),
            ids: vec![1, 2, 3],
        }
        .sql();
        assert_eq!(sql, "DELETE FROM `User` WHERE `ID` IN (1,2,3)");
    }
}

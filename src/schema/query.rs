//! Cached Query Declarations

use std::collections::BTreeSet;

use crate::sql::SortOrder;

/// Default maximum number of IDs a cached query keeps
pub const DEFAULT_MAX_RESULTS: usize = 50_000;

/// Named secondary-index query whose ID list is cached in shards.
///
/// The template is a conjunction of equality conditions on `fields`, one
/// bound parameter each, followed by an ordering. Without an explicit
/// ordering rows are ordered by `ID`.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub name: String,
    pub fields: Vec<String>,
    pub order_by: Vec<(String, SortOrder)>,
    pub max: usize,
}

impl CachedQuery {
    /// Declare a cached query
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            order_by: Vec::new(),
            max: DEFAULT_MAX_RESULTS,
        }
    }

    /// Add an equality condition bound to the next parameter
    pub fn filter(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// Add an ordering column
    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push((field.into(), order));
        self
    }

    /// Override the maximum result size
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    /// Ordering applied to storage queries, ID as the final tie-breaker
    pub fn effective_order(&self) -> Vec<(String, SortOrder)> {
        let mut order = self.order_by.clone();
        if !order.iter().any(|(c, _)| c == "ID") {
            order.push(("ID".to_string(), SortOrder::Asc));
        }
        order
    }

    /// Every column whose change can move a row in or out of a cached page
    pub fn touched_columns<'a>(&'a self, soft_delete: Option<&'a str>) -> BTreeSet<&'a str> {
        let mut cols: BTreeSet<&str> = self.fields.iter().map(String::as_str).collect();
        cols.extend(self.order_by.iter().map(|(c, _)| c.as_str()));
        if let Some(column) = soft_delete {
            cols.insert(column);
        }
        cols
    }

    /// Check whether a set of changed columns affects this query
    pub fn is_affected_by<'a>(
        &self,
        changed: impl IntoIterator<Item = &'a str>,
        soft_delete: Option<&str>,
    ) -> bool {
        let touched = self.touched_columns(soft_delete);
        changed.into_iter().any(|c| touched.contains(c))
    }
}

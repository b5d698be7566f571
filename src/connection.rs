//! Statement routing
//!
//! A [`Connection`] is where the statements and queries of one pool go for
//! a session: straight to the pool, or through the transaction the session
//! holds on it. Every call is logged and counted here.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::ports::{BatchResult, Storage, Transaction};
use crate::error::Result;
use crate::flush::Effects;
use crate::schema::Registry;
use crate::sql::{ExecResult, Query, Row, Statement};

/// Transaction a session holds on one pool
pub(crate) struct OpenTransaction {
    pub handle: Box<dyn Transaction>,
    /// Cache effects waiting for the commit
    pub effects: Effects,
}

/// Open transactions of a session, by pool
pub(crate) type Transactions = HashMap<String, OpenTransaction>;

#[derive(Clone, Copy)]
pub(crate) struct Connection<'a> {
    registry: &'a Registry,
    storage: &'a Arc<dyn Storage>,
    transaction: Option<&'a dyn Transaction>,
}

impl<'a> Connection<'a> {
    /// Connection to `pool`, inside the open transaction on it if any
    pub fn open(
        registry: &'a Registry,
        transactions: Option<&'a Transactions>,
        pool: &str,
    ) -> Result<Self> {
        let storage = registry.storage(pool)?;
        let transaction = transactions
            .and_then(|open| open.get(pool))
            .map(|open| &*open.handle);
        Ok(Self {
            registry,
            storage,
            transaction,
        })
    }

    pub fn pool(&self) -> &str {
        self.storage.pool()
    }

    pub fn auto_increment_step(&self) -> u64 {
        self.storage.auto_increment_step()
    }

    /// Whether writes and reads run inside a session transaction
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Execute one statement
    pub async fn exec(&self, statement: &Statement) -> Result<ExecResult> {
        let (sql, args) = statement.sql();
        debug!(
            pool = %self.pool(),
            sql = %sql,
            args = args.len(),
            transaction = self.in_transaction(),
            "Executing statement"
        );
        let result = match self.transaction {
            Some(transaction) => transaction.exec(statement).await?,
            None => self.storage.exec(statement).await?,
        };
        self.registry.metrics().record_statements(1);
        Ok(result)
    }

    /// Execute statements in one round trip, stopping at the first failure
    pub async fn exec_batch(&self, statements: &[Statement]) -> BatchResult {
        for statement in statements {
            debug!(pool = %self.pool(), sql = %statement.sql().0, "Executing statement");
        }
        let batch = match self.transaction {
            Some(transaction) => transaction.exec_batch(statements).await,
            None => self.storage.exec_batch(statements).await,
        };
        self.registry
            .metrics()
            .record_statements(batch.applied() as u64);
        batch
    }

    /// Execute statements all-or-nothing in a transaction of their own
    pub async fn exec_batch_atomic(&self, statements: &[Statement]) -> Result<Vec<ExecResult>> {
        let transaction = self.storage.begin().await?;
        let scoped = Connection {
            registry: self.registry,
            storage: self.storage,
            transaction: Some(&*transaction),
        };
        let batch = scoped.exec_batch(statements).await;
        match batch.error {
            None => {
                transaction.commit().await?;
                Ok(batch.results)
            }
            Some(e) => {
                if let Err(rollback) = transaction.rollback().await {
                    warn!(pool = %self.pool(), error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run a query
    pub async fn query(&self, query: &Query) -> Result<Vec<Row>> {
        let (sql, args) = query.sql();
        debug!(pool = %self.pool(), sql = %sql, args = args.len(), "Running query");
        let rows = match self.transaction {
            Some(transaction) => transaction.query_rows(query).await?,
            None => self.storage.query_rows(query).await?,
        };
        self.registry.metrics().record_query();
        Ok(rows)
    }
}

//! Domain Ports (Port/Adapter Pattern)
//!
//! The engine talks to its collaborators only through these traits.
//! Adapters implement them for concrete backends; the in-memory adapters in
//! [`crate::adapters`] implement them for tests and the demo.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Flush Engine / Resolver / Search             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │      Storage   │   CacheTier   │   EventPublisher    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  MemoryStorage │ LocalCache │ MemorySharedCache │ Publishers │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::schema::EntitySchema;
use crate::sql::{ExecResult, Query, Row, Statement};

use super::events::QueueEvent;

/// Reserved cache value meaning "confirmed absent"
pub const NIL: &str = "nil";

// =============================================================================
// Storage Port
// =============================================================================

/// Port for one relational storage pool.
///
/// Every statement is atomic on its own. A transaction is a handle owned by
/// whoever opened it; statements run on the pool itself never join it.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Pool name
    fn pool(&self) -> &str;

    /// Auto-increment step used by the pool (`auto_increment_increment`)
    fn auto_increment_step(&self) -> u64 {
        1
    }

    /// Called once per entity schema when the registry is validated.
    fn register_table(&self, _schema: &EntitySchema) {}

    /// Execute one write statement.
    async fn exec(&self, statement: &Statement) -> Result<ExecResult>;

    /// Execute several statements in one round trip.
    ///
    /// Execution stops at the first failure. Statements before it stay
    /// applied and their results are reported.
    async fn exec_batch(&self, statements: &[Statement]) -> BatchResult {
        let mut batch = BatchResult::default();
        for statement in statements {
            match self.exec(statement).await {
                Ok(result) => batch.results.push(result),
                Err(e) => {
                    batch.error = Some(e);
                    break;
                }
            }
        }
        batch
    }

    /// Run a query returning all matching rows.
    async fn query_rows(&self, query: &Query) -> Result<Vec<Row>>;

    /// Run a query returning at most one row.
    async fn query_row(&self, query: &Query) -> Result<Option<Row>> {
        Ok(self.query_rows(query).await?.into_iter().next())
    }

    /// Open a transaction on this pool.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Port for a transaction opened with [`Storage::begin`].
///
/// Queries run through the handle see its own uncommitted writes. Nothing it
/// writes is visible on the pool before [`commit`](Transaction::commit).
/// A handle dropped without commit is rolled back.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Pool name
    fn pool(&self) -> &str;

    /// Execute one write statement inside the transaction.
    async fn exec(&self, statement: &Statement) -> Result<ExecResult>;

    /// Execute several statements in one round trip, stopping at the first
    /// failure like [`Storage::exec_batch`].
    async fn exec_batch(&self, statements: &[Statement]) -> BatchResult {
        let mut batch = BatchResult::default();
        for statement in statements {
            match self.exec(statement).await {
                Ok(result) => batch.results.push(result),
                Err(e) => {
                    batch.error = Some(e);
                    break;
                }
            }
        }
        batch
    }

    /// Run a query inside the transaction.
    async fn query_rows(&self, query: &Query) -> Result<Vec<Row>>;

    /// Make the writes of the transaction visible on the pool.
    async fn commit(&self) -> Result<()>;

    /// Discard the writes of the transaction.
    async fn rollback(&self) -> Result<()>;
}

/// Outcome of a multi-statement round trip
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Results of the applied statements, in order
    pub results: Vec<ExecResult>,
    /// Failure that stopped the batch
    pub error: Option<Error>,
}

impl BatchResult {
    /// Number of statements applied before the batch stopped
    pub fn applied(&self) -> usize {
        self.results.len()
    }

    pub fn into_result(self) -> Result<Vec<ExecResult>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.results),
        }
    }
}

// =============================================================================
// Cache Tier Port
// =============================================================================

/// Port for a string-valued cache tier (process-local or shared).
///
/// `Ok(None)` is a miss; the [`NIL`] sentinel is returned like any other
/// value so callers can tell "confirmed absent" from "unknown".
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Pool name
    fn pool(&self) -> &str;

    /// Get one value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Get many values, aligned with `keys`.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Set one value.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Set many values.
    async fn multi_set(&self, entries: Vec<(String, String)>) -> Result<()>;

    /// Get hash fields, aligned with `fields`.
    async fn hash_get(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

    /// Set hash fields.
    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<()>;

    /// Delete keys (plain or hash).
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Remove every entry.
    async fn clear(&self) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for invalidation and queue channels.
///
/// Delivery is at-least-once; consumers must tolerate duplicates.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event to a channel.
    async fn publish(&self, channel: &str, event: QueueEvent) -> Result<()>;

    /// Publish multiple events to a channel.
    async fn publish_all(&self, channel: &str, events: Vec<QueueEvent>) -> Result<()> {
        for event in events {
            self.publish(channel, event).await?;
        }
        Ok(())
    }
}

//! Read Path
//!
//! Point lookups, batch lookups with reference warm-up and the sharded
//! cached search. Every read resolves through the cache tiers of the entity
//! before storage and back-fills exactly the tiers that missed. Rows read
//! inside a session transaction are never written to a tier.

mod load;
mod pager;
mod search;
mod warmup;

#[cfg(test)]
mod proptest;

use std::sync::Arc;

use crate::cache::LocalCache;
use crate::connection::{Connection, Transactions};
use crate::error::Result;
use crate::schema::Registry;

pub use pager::Pager;

pub(crate) use load::{fetch_rows, load_by_id, load_by_ids};
pub(crate) use search::{search_ids, shard_span};
pub(crate) use warmup::warm_up;

/// Session state a read works against
#[derive(Clone, Copy)]
pub(crate) struct ReadContext<'a> {
    pub registry: &'a Registry,
    /// Request-scoped data loader replacing the local tier
    pub loader: Option<&'a Arc<LocalCache>>,
    /// Open transactions of the session; their pools are read through them
    pub transactions: Option<&'a Transactions>,
}

impl<'a> ReadContext<'a> {
    pub fn connection(&self, pool: &str) -> Result<Connection<'a>> {
        Connection::open(self.registry, self.transactions, pool)
    }
}

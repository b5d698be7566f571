//! tierorm - Cache-consistent Entity Mapping
//!
//! Maps entity types onto relational tables and keeps storage, a
//! process-local cache and a shared remote cache consistent while serving
//! point lookups, batch lookups and paginated index queries.
//!
//! # Architecture
//!
//! ```text
//!             ┌────────────── Session ──────────────┐
//!             │  flush / delete        load / search │
//!             └───────┬──────────────────────┬───────┘
//!                     ▼                      ▼
//!               Flush Engine       Resolver / Cached Search
//!             (dirty detection)     (local → shared → storage)
//!                     │                      │
//!      ┌──────────────┼──────────────────────┼──────────────┐
//!      ▼              ▼                      ▼              ▼
//!   Storage      Local tier            Shared tier     Event channels
//! ```
//!
//! Every write goes through the flush engine, which computes minimal change
//! sets, runs batched statements and only then updates the cache tiers.
//! Reads resolve through the tiers nearest first and back-fill what missed.
//!
//! # Modules
//!
//! - [`adapters`] - In-memory storage and shared cache, event publishers
//! - [`cache`] - Local tier, cache keys, value codec and engine metrics
//! - [`config`] - Pool configuration
//! - [`dirty`] - Dirty-state detection
//! - [`domain`] - Storage, cache tier and publisher ports; queue events
//! - [`entity`] - Entity trait, persistence state and reference fields
//! - [`error`] - Error types
//! - [`schema`] - Entity schemas and the registry
//! - [`session`] - Request-scoped reads and writes
//! - [`sql`] - Structured statements and queries

pub mod adapters;
pub mod cache;
pub mod config;
mod connection;
pub mod dirty;
pub mod domain;
pub mod entity;
pub mod error;
mod flush;
mod read;
pub mod schema;
pub mod session;
pub mod sql;
pub mod value;

// Re-export commonly used types
pub use cache::{EngineMetrics, LocalCache, MetricsSnapshot};
pub use config::{AdapterFactory, MemoryAdapterFactory, OrmConfig};
pub use dirty::{compute_dirty, DirtyState};
pub use domain::events::{FlushAction, QueueEvent, LAZY_CHANNEL};
pub use domain::ports::{BatchResult, CacheTier, EventPublisher, Storage, Transaction, NIL};
pub use entity::{DeleteMark, Entity, EntityState, Reference, ReferenceList, SharedEntity};
pub use error::{Error, Result};
pub use flush::FlushConfig;
pub use read::Pager;
pub use schema::{
    CachedQuery, Column, ColumnKind, EntitySchema, OnDelete, Registry, RegistryBuilder,
};
pub use session::Session;
pub use sql::SortOrder;
pub use value::Value;

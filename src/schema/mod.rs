//! Schema Registry
//!
//! Entity descriptors, column kinds, cached query declarations and the
//! validated [`Registry`] that binds them to storage pools, cache tiers and
//! the event publisher.
//!
//! # Lifecycle
//!
//! ```text
//! EntitySchema::builder(..) ──▶ RegistryBuilder ──validate()──▶ Arc<Registry>
//!                                                                  │
//!                                                   registry.session() per request
//! ```

mod column;
mod entity;
mod query;
mod registry;

pub use column::{
    round_float, round_significant, Column, ColumnKind, OnDelete, Precision, NARROW_FLOAT_DIGITS,
    WIDE_FLOAT_DIGITS,
};
pub use entity::{DirtyChannel, EntitySchema, EntitySchemaBuilder, ID_COLUMN};
pub use query::{CachedQuery, DEFAULT_MAX_RESULTS};
pub use registry::{Referrer, Registry, RegistryBuilder};

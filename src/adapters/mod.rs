//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │        Storage │ CacheTier │ EventPublisher                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ MemoryStorage │ MemorySharedCache                          │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The process-local tier ([`crate::cache::LocalCache`]) implements
//! `CacheTier` directly.
//!
//! # Usage
//!
//! ```ignore
//! use tierorm::adapters::{MemorySharedCache, MemoryStorage};
//!
//! let registry = Registry::builder()
//!     .storage(Arc::new(MemoryStorage::new("default")))
//!     .shared_cache(Arc::new(MemorySharedCache::new("default")))
//!     .entity(user_schema)
//!     .validate()?;
//! ```

mod memory_cache;
mod memory_storage;

pub use memory_cache::MemorySharedCache;
pub use memory_storage::MemoryStorage;

// Re-export event publishers for convenience
mod event_publisher;
pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};

//! Domain Layer
//!
//! Ports the engine depends on and the events it publishes.
//!
//! - **Ports** (`ports.rs`) - `Storage`, `CacheTier` and `EventPublisher` traits
//! - **Events** (`events.rs`) - dirty, log and lazy queue events
//!
//! # Usage
//!
//! ```ignore
//! use tierorm::domain::ports::{CacheTier, Storage};
//!
//! async fn warm<S: Storage, C: CacheTier>(storage: &S, cache: &C) -> Result<()> {
//!     // ...
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{FlushAction, QueueEvent, LAZY_CHANNEL};
pub use ports::{BatchResult, CacheTier, EventPublisher, Storage, Transaction, NIL};

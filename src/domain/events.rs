//! Queue Events
//!
//! Events published by the flush engine. Dirty events drive external cache
//! invalidation and search re-indexing, log events record row-level change
//! history, lazy events carry deferred write statements to a queue consumer.
//!
//! # Example
//!
//! ```ignore
//! let event = QueueEvent::dirty("User", 15, FlushAction::Update, vec!["Age".into()]);
//! publisher.publish("user_changed", event).await?;
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sql::Statement;

/// Channel carrying lazily flushed statements
pub const LAZY_CHANNEL: &str = "orm-lazy-channel";

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushAction {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for FlushAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushAction::Insert => write!(f, "insert"),
            FlushAction::Update => write!(f, "update"),
            FlushAction::Delete => write!(f, "delete"),
        }
    }
}

/// Event published by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueueEvent {
    /// An entity row changed
    Dirty {
        entity: String,
        id: u64,
        action: FlushAction,
        changed: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Change log record with before and after values of changed columns
    Log {
        entity: String,
        table: String,
        pool: String,
        id: u64,
        action: FlushAction,
        before: Option<BTreeMap<String, serde_json::Value>>,
        changes: BTreeMap<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    },

    /// Statement queued by a lazy flush
    Lazy {
        entity: String,
        statement: Statement,
        timestamp: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Create a dirty event
    pub fn dirty(
        entity: impl Into<String>,
        id: u64,
        action: FlushAction,
        changed: Vec<String>,
    ) -> Self {
        QueueEvent::Dirty {
            entity: entity.into(),
            id,
            action,
            changed,
            timestamp: Utc::now(),
        }
    }

    /// Create a lazy statement event
    pub fn lazy(entity: impl Into<String>, statement: Statement) -> Self {
        QueueEvent::Lazy {
            entity: entity.into(),
            statement,
            timestamp: Utc::now(),
        }
    }

    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            QueueEvent::Dirty { .. } => "Dirty",
            QueueEvent::Log { .. } => "Log",
            QueueEvent::Lazy { .. } => "Lazy",
        }
    }

    /// Entity the event concerns
    pub fn entity(&self) -> &str {
        match self {
            QueueEvent::Dirty { entity, .. }
            | QueueEvent::Log { entity, .. }
            | QueueEvent::Lazy { entity, .. } => entity,
        }
    }

    /// Row ID, when known at publish time
    pub fn id(&self) -> Option<u64> {
        match self {
            QueueEvent::Dirty { id, .. } | QueueEvent::Log { id, .. } => Some(*id),
            QueueEvent::Lazy { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_event_serialization() {
        let event = QueueEvent::dirty("User", 15, FlushAction::Update, vec!["Age".into()]);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Dirty\""));
        assert!(json.contains("\"action\":\"update\""));

        let back: QueueEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_lazy_event_carries_statement() {
        let statement = Statement::Delete {
            table: "User".into(),
            ids: vec![1, 2],
        };
        let event = QueueEvent::lazy("User", statement.clone());
        assert_eq!(event.event_type(), "Lazy");
        assert_eq!(event.entity(), "User");
        assert_eq!(event.id(), None);

        let json = serde_json::to_string(&event).unwrap();
        match serde_json::from_str::<QueueEvent>(&json).unwrap() {
            QueueEvent::Lazy { statement: back, .. } => assert_eq!(back, statement),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_update_statement_roundtrip() {
        let statement = Statement::Update {
            table: "User".into(),
            id: 3,
            assignments: vec![crate::sql::Assignment {
                column: "Age".into(),
                value: Value::Int(18),
            }],
        };
        let event = QueueEvent::lazy("User", statement);
        let json = serde_json::to_string(&event).unwrap();
        let back: QueueEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "Lazy");
    }
}

//! Error types for the cache-consistency engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of pool an entity or configuration refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Relational storage pool
    Storage,
    /// Process-local cache pool
    LocalCache,
    /// Shared remote cache pool
    SharedCache,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Storage => write!(f, "storage"),
            PoolKind::LocalCache => write!(f, "local cache"),
            PoolKind::SharedCache => write!(f, "shared cache"),
        }
    }
}

/// Errors that can occur in the cache-consistency engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Entity type was never registered
    #[error("entity '{0}' is not registered")]
    UnregisteredEntity(String),

    /// Pool referenced by a schema or call was never registered
    #[error("{kind} pool '{name}' is not registered")]
    UnregisteredPool { kind: PoolKind, name: String },

    /// Cached query name not declared on the entity
    #[error("cached query '{index}' is not declared for entity '{entity}'")]
    UnknownIndex { entity: String, index: String },

    /// Reference path segment does not name a reference field
    #[error("invalid reference '{path}' for entity '{entity}'")]
    InvalidReference { entity: String, path: String },

    /// Requested page size exceeds the index maximum
    #[error("page size {requested} exceeds max {max} of cached query '{index}'")]
    PageSizeExceeded {
        index: String,
        requested: usize,
        max: usize,
    },

    /// Wrong number of bound parameters for a cached query
    #[error("cached query '{index}' expects {expected} parameters, got {got}")]
    ParameterCount {
        index: String,
        expected: usize,
        got: usize,
    },

    /// Schema declaration failed validation
    #[error("invalid schema for entity '{entity}': {reason}")]
    InvalidSchema { entity: String, reason: String },

    /// Update or delete requested for an entity that was never loaded
    #[error("entity '{entity}' with id {id} is not loaded and can't be {operation}")]
    NotLoaded {
        entity: String,
        id: u64,
        operation: &'static str,
    },

    /// Unsaved references form a cycle
    #[error("reference cycle detected while flushing '{entity}': {path}")]
    FlushCycle { entity: String, path: String },

    /// Operation requires an entity cache tier that is not configured
    #[error("entity '{0}' has no cache tier configured")]
    NoCacheTier(String),

    /// Invalid pool configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration document could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Constraint Violations
    // =========================================================================
    /// Unique index conflict reported by storage
    #[error("duplicated key in index '{index}': {message}")]
    DuplicatedKey { index: String, message: String },

    /// Foreign key restrict violation
    #[error("foreign key '{constraint}' violated: {message}")]
    ForeignKey { constraint: String, message: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Storage backend failure
    #[error("storage error on pool '{pool}': {reason}")]
    Storage { pool: String, reason: String },

    /// Cache tier failure
    #[error("cache error on pool '{pool}': {reason}")]
    Cache { pool: String, reason: String },

    /// Event sink failure
    #[error("publish to channel '{channel}' failed: {reason}")]
    Publish { channel: String, reason: String },

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Cached value could not be decoded
    #[error("failed to decode cached value for key '{key}': {reason}")]
    Codec { key: String, reason: String },

    /// Column value does not fit the declared column kind
    #[error("column '{column}' expects {expected}, got {got}")]
    ValueType {
        column: String,
        expected: String,
        got: String,
    },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Programmer errors that must never be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnregisteredEntity(_)
                | Error::UnregisteredPool { .. }
                | Error::UnknownIndex { .. }
                | Error::InvalidReference { .. }
                | Error::PageSizeExceeded { .. }
                | Error::ParameterCount { .. }
                | Error::InvalidSchema { .. }
                | Error::NotLoaded { .. }
                | Error::FlushCycle { .. }
                | Error::NoCacheTier(_)
                | Error::Config(_)
                | Error::ConfigParse(_)
        )
    }

    /// Constraint violations surfaced from storage.
    pub fn is_constraint(&self) -> bool {
        matches!(self, Error::DuplicatedKey { .. } | Error::ForeignKey { .. })
    }

    /// Transient backend failures.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::Cache { .. } | Error::Publish { .. }
        )
    }

    pub(crate) fn cache(pool: &str, reason: impl std::fmt::Display) -> Self {
        Error::Cache {
            pool: pool.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn storage(pool: &str, reason: impl std::fmt::Display) -> Self {
        Error::Storage {
            pool: pool.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = Error::UnknownIndex {
            entity: "User".into(),
            index: "IndexAge".into(),
        };
        assert!(err.is_configuration());
        assert!(!err.is_constraint());

        let err = Error::ForeignKey {
            constraint: "Post:Author".into(),
            message: "referenced".into(),
        };
        assert!(err.is_constraint());
        assert!(!err.is_backend());

        let err = Error::cache("default", "connection refused");
        assert!(err.is_backend());
        assert_eq!(
            err.to_string(),
            "cache error on pool 'default': connection refused"
        );
    }

    #[test]
    fn test_pool_kind_display() {
        let err = Error::UnregisteredPool {
            kind: PoolKind::SharedCache,
            name: "sessions".into(),
        };
        assert_eq!(
            err.to_string(),
            "shared cache pool 'sessions' is not registered"
        );
    }
}

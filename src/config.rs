//! Pool Configuration
//!
//! Storage pools, local cache pools and shared cache pools are described in
//! a YAML document and turned into port implementations by an
//! [`AdapterFactory`].
//!
//! # Example
//!
//! ```yaml
//! storage:
//!   default:
//!     uri: memory://default
//!     auto_increment_step: 1
//! local_cache:
//!   default:
//!     capacity: 100000
//! shared_cache:
//!   default:
//!     address: memory://sessions
//!     namespace: app
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::adapters::{MemorySharedCache, MemoryStorage};
use crate::cache::DEFAULT_LOCAL_CAPACITY;
use crate::domain::ports::{CacheTier, Storage};
use crate::error::{Error, Result};

/// URI scheme served by [`MemoryAdapterFactory`]
pub const MEMORY_SCHEME: &str = "memory://";

/// Complete pool configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmConfig {
    /// Storage pools by name
    pub storage: BTreeMap<String, StoragePoolConfig>,
    /// Process-local cache pools by name
    pub local_cache: BTreeMap<String, LocalCachePoolConfig>,
    /// Shared cache pools by name
    pub shared_cache: BTreeMap<String, SharedCachePoolConfig>,
}

/// Storage pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolConfig {
    /// Connection URI
    pub uri: String,
    /// Auto-increment step of the server (`auto_increment_increment`)
    #[serde(default = "default_auto_increment_step")]
    pub auto_increment_step: u64,
}

/// Local cache pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalCachePoolConfig {
    /// Maximum number of entries
    #[serde(default = "default_local_capacity")]
    pub capacity: usize,
}

impl Default for LocalCachePoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOCAL_CAPACITY,
        }
    }
}

/// Shared cache pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedCachePoolConfig {
    /// Server address
    pub address: String,
    /// Optional key namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_auto_increment_step() -> u64 {
    1
}

fn default_local_capacity() -> usize {
    DEFAULT_LOCAL_CAPACITY
}

impl OrmConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: OrmConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    /// Check pool settings
    pub fn validate(&self) -> Result<()> {
        for (name, pool) in &self.storage {
            if pool.uri.trim().is_empty() {
                return Err(Error::Config(format!("storage pool '{}' has no uri", name)));
            }
            if pool.auto_increment_step == 0 {
                return Err(Error::Config(format!(
                    "storage pool '{}' has auto_increment_step 0",
                    name
                )));
            }
        }
        for (name, pool) in &self.local_cache {
            if pool.capacity == 0 {
                return Err(Error::Config(format!(
                    "local cache pool '{}' has capacity 0",
                    name
                )));
            }
        }
        for (name, pool) in &self.shared_cache {
            if pool.address.trim().is_empty() {
                return Err(Error::Config(format!(
                    "shared cache pool '{}' has no address",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Total number of configured pools
    pub fn pool_count(&self) -> usize {
        self.storage.len() + self.local_cache.len() + self.shared_cache.len()
    }
}

// =============================================================================
// Adapter Factory
// =============================================================================

/// Builds port implementations for configured pools
pub trait AdapterFactory {
    /// Connect a storage pool
    fn storage(&self, name: &str, config: &StoragePoolConfig) -> Result<Arc<dyn Storage>>;

    /// Connect a shared cache pool
    fn shared_cache(&self, name: &str, config: &SharedCachePoolConfig)
        -> Result<Arc<dyn CacheTier>>;
}

/// Factory for the in-memory adapters, accepting `memory://` URIs only
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryAdapterFactory;

impl MemoryAdapterFactory {
    fn check_scheme(kind: &str, name: &str, uri: &str) -> Result<()> {
        if uri.starts_with(MEMORY_SCHEME) {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "{} pool '{}': unsupported uri '{}', expected {}",
                kind, name, uri, MEMORY_SCHEME
            )))
        }
    }
}

impl AdapterFactory for MemoryAdapterFactory {
    fn storage(&self, name: &str, config: &StoragePoolConfig) -> Result<Arc<dyn Storage>> {
        Self::check_scheme("storage", name, &config.uri)?;
        Ok(Arc::new(
            MemoryStorage::new(name).with_auto_increment_step(config.auto_increment_step),
        ))
    }

    fn shared_cache(
        &self,
        name: &str,
        config: &SharedCachePoolConfig,
    ) -> Result<Arc<dyn CacheTier>> {
        Self::check_scheme("shared cache", name, &config.address)?;
        Ok(Arc::new(MemorySharedCache::new(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const YAML: &str = r#"
storage:
  default:
    uri: memory://default
    auto_increment_step: 2
  logs:
    uri: memory://logs
local_cache:
  default:
    capacity: 500
  tiny: {}
shared_cache:
  default:
    address: memory://sessions
    namespace: app
"#;

    #[test]
    fn test_parse_config() {
        let config = OrmConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.storage["default"].auto_increment_step, 2);
        assert_eq!(config.storage["logs"].auto_increment_step, 1);
        assert_eq!(config.local_cache["default"].capacity, 500);
        assert_eq!(config.local_cache["tiny"].capacity, DEFAULT_LOCAL_CAPACITY);
        assert_eq!(
            config.shared_cache["default"].namespace.as_deref(),
            Some("app")
        );
        assert_eq!(config.pool_count(), 5);
    }

    #[test]
    fn test_empty_document() {
        let config = OrmConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, OrmConfig::default());
    }

    #[test]
    fn test_invalid_config() {
        assert_matches!(
            OrmConfig::from_yaml_str("storage: [1, 2"),
            Err(Error::ConfigParse(_))
        );
        assert_matches!(
            OrmConfig::from_yaml_str("storage:\n  default:\n    uri: ''\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            OrmConfig::from_yaml_str("local_cache:\n  default:\n    capacity: 0\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            OrmConfig::from_file("/nonexistent/tierorm.yaml"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_memory_factory() {
        let factory = MemoryAdapterFactory;
        let storage = factory
            .storage(
                "default",
                &StoragePoolConfig {
                    uri: "memory://default".into(),
                    auto_increment_step: 3,
                },
            )
            .unwrap();
        assert_eq!(storage.pool(), "default");
        assert_eq!(storage.auto_increment_step(), 3);

        let err = factory
            .storage(
                "default",
                &StoragePoolConfig {
                    uri: "mysql://root@localhost/db".into(),
                    auto_increment_step: 1,
                },
            )
            .err();
        assert_matches!(err, Some(Error::Config(_)));
    }
}

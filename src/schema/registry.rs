//! Registry
//!
//! Read-only catalogue of entity schemas, storage pools, cache tiers and the
//! event publisher. Built once with [`RegistryBuilder`], validated, then
//! shared by every session.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::adapters::LoggingEventPublisher;
use crate::cache::{EngineMetrics, LocalCache};
use crate::config::{AdapterFactory, OrmConfig};
use crate::domain::ports::{CacheTier, EventPublisher, Storage};
use crate::entity::{entity_name_of, Entity};
use crate::error::{Error, PoolKind, Result};
use crate::flush::FlushConfig;
use crate::session::Session;

use super::column::{ColumnKind, OnDelete};
use super::entity::EntitySchema;

/// Single-reference column pointing at an entity type
#[derive(Debug, Clone)]
pub struct Referrer {
    /// Schema declaring the reference
    pub schema: Arc<EntitySchema>,
    /// Reference column
    pub column: String,
    pub on_delete: OnDelete,
}

/// Validated catalogue shared by sessions
pub struct Registry {
    schemas: HashMap<String, Arc<EntitySchema>>,
    storages: HashMap<String, Arc<dyn Storage>>,
    local_caches: HashMap<String, Arc<dyn CacheTier>>,
    shared_caches: HashMap<String, Arc<dyn CacheTier>>,
    publisher: Arc<dyn EventPublisher>,
    referrers: HashMap<String, Vec<Referrer>>,
    metrics: Arc<EngineMetrics>,
    flush_config: FlushConfig,
}

impl Registry {
    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Open a request-scoped session
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    /// Schema of a registered entity
    pub fn schema(&self, entity: &str) -> Result<&Arc<EntitySchema>> {
        self.schemas
            .get(entity)
            .ok_or_else(|| Error::UnregisteredEntity(entity.to_string()))
    }

    /// Schema of a registered entity type
    pub fn schema_of<T: Entity + Default>(&self) -> Result<&Arc<EntitySchema>> {
        self.schema(entity_name_of::<T>())
    }

    /// All registered schemas
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.schemas.values()
    }

    /// Storage pool by name
    pub fn storage(&self, pool: &str) -> Result<&Arc<dyn Storage>> {
        self.storages.get(pool).ok_or_else(|| Error::UnregisteredPool {
            kind: PoolKind::Storage,
            name: pool.to_string(),
        })
    }

    /// Local cache pool by name
    pub fn local_cache(&self, pool: &str) -> Result<&Arc<dyn CacheTier>> {
        self.local_caches
            .get(pool)
            .ok_or_else(|| Error::UnregisteredPool {
                kind: PoolKind::LocalCache,
                name: pool.to_string(),
            })
    }

    /// Shared cache pool by name
    pub fn shared_cache(&self, pool: &str) -> Result<&Arc<dyn CacheTier>> {
        self.shared_caches
            .get(pool)
            .ok_or_else(|| Error::UnregisteredPool {
                kind: PoolKind::SharedCache,
                name: pool.to_string(),
            })
    }

    /// Local tier assigned to a schema
    pub(crate) fn local_tier(&self, schema: &EntitySchema) -> Option<&Arc<dyn CacheTier>> {
        schema.local_cache().and_then(|p| self.local_caches.get(p))
    }

    /// Shared tier assigned to a schema
    pub(crate) fn shared_tier(&self, schema: &EntitySchema) -> Option<&Arc<dyn CacheTier>> {
        schema.shared_cache().and_then(|p| self.shared_caches.get(p))
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }

    /// Single-reference columns of other entities pointing at `entity`
    pub fn referrers(&self, entity: &str) -> &[Referrer] {
        self.referrers
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn flush_config(&self) -> &FlushConfig {
        &self.flush_config
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entities: Vec<_> = self.schemas.keys().collect();
        entities.sort();
        f.debug_struct("Registry")
            .field("entities", &entities)
            .field("storage_pools", &self.storages.len())
            .field("local_caches", &self.local_caches.len())
            .field("shared_caches", &self.shared_caches.len())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects pools and schemas before validation
#[derive(Default)]
pub struct RegistryBuilder {
    schemas: Vec<EntitySchema>,
    storages: HashMap<String, Arc<dyn Storage>>,
    local_caches: HashMap<String, Arc<dyn CacheTier>>,
    shared_caches: HashMap<String, Arc<dyn CacheTier>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    metrics: Option<Arc<EngineMetrics>>,
    flush_config: FlushConfig,
}

impl RegistryBuilder {
    /// Register an entity schema
    pub fn entity(mut self, schema: EntitySchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Register a storage pool under its own pool name
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storages.insert(storage.pool().to_string(), storage);
        self
    }

    /// Register a process-local cache pool
    pub fn local_cache(self, cache: Arc<LocalCache>) -> Self {
        self.local_cache_tier(cache)
    }

    /// Register any tier implementation as a process-local pool
    pub fn local_cache_tier(mut self, cache: Arc<dyn CacheTier>) -> Self {
        self.local_caches.insert(cache.pool().to_string(), cache);
        self
    }

    /// Register a shared cache pool
    pub fn shared_cache(mut self, cache: Arc<dyn CacheTier>) -> Self {
        self.shared_caches.insert(cache.pool().to_string(), cache);
        self
    }

    /// Event publisher for dirty, log and lazy channels
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Share a metrics collector instead of creating one
    pub fn metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn flush_config(mut self, config: FlushConfig) -> Self {
        self.flush_config = config;
        self
    }

    /// Register every pool of a configuration document
    pub fn apply_config(
        mut self,
        config: &OrmConfig,
        factory: &dyn AdapterFactory,
    ) -> Result<Self> {
        config.validate()?;
        for (name, pool) in &config.storage {
            let storage = factory.storage(name, pool)?;
            self.storages.insert(name.clone(), storage);
        }
        for (name, pool) in &config.local_cache {
            let cache: Arc<dyn CacheTier> =
                Arc::new(LocalCache::with_capacity(name.clone(), pool.capacity));
            self.local_caches.insert(name.clone(), cache);
        }
        for (name, pool) in &config.shared_cache {
            let cache = factory.shared_cache(name, pool)?;
            self.shared_caches.insert(name.clone(), cache);
        }
        debug!(pools = config.pool_count(), "Applied pool configuration");
        Ok(self)
    }

    /// Check every schema against the registered pools and entities
    pub fn validate(self) -> Result<Arc<Registry>> {
        let mut schemas: HashMap<String, Arc<EntitySchema>> = HashMap::new();
        for schema in self.schemas {
            let name = schema.entity().to_string();
            if schemas.contains_key(&name) {
                return Err(Error::InvalidSchema {
                    entity: name,
                    reason: "entity registered twice".into(),
                });
            }
            schemas.insert(name, Arc::new(schema));
        }

        for schema in schemas.values() {
            if !self.storages.contains_key(schema.pool()) {
                return Err(Error::UnregisteredPool {
                    kind: PoolKind::Storage,
                    name: schema.pool().to_string(),
                });
            }
            if let Some(pool) = schema.local_cache() {
                if !self.local_caches.contains_key(pool) {
                    return Err(Error::UnregisteredPool {
                        kind: PoolKind::LocalCache,
                        name: pool.to_string(),
                    });
                }
            }
            if let Some(pool) = schema.shared_cache() {
                if !self.shared_caches.contains_key(pool) {
                    return Err(Error::UnregisteredPool {
                        kind: PoolKind::SharedCache,
                        name: pool.to_string(),
                    });
                }
            }
            for column in schema.columns() {
                if let Some(target) = column.kind.reference_target() {
                    if !schemas.contains_key(target) {
                        return Err(Error::UnregisteredEntity(target.to_string()));
                    }
                }
            }
        }

        let mut referrers: HashMap<String, Vec<Referrer>> = HashMap::new();
        for schema in schemas.values() {
            for column in schema.columns() {
                if let ColumnKind::Reference { target, on_delete } = &column.kind {
                    referrers.entry(target.clone()).or_default().push(Referrer {
                        schema: Arc::clone(schema),
                        column: column.name.clone(),
                        on_delete: *on_delete,
                    });
                }
            }
        }
        for list in referrers.values_mut() {
            list.sort_by(|a, b| {
                let left = (a.schema.entity(), a.column.as_str());
                left.cmp(&(b.schema.entity(), b.column.as_str()))
            });
        }

        for schema in schemas.values() {
            if let Some(storage) = self.storages.get(schema.pool()) {
                storage.register_table(schema);
            }
        }

        info!(
            entities = schemas.len(),
            storage_pools = self.storages.len(),
            local_caches = self.local_caches.len(),
            shared_caches = self.shared_caches.len(),
            "Registry validated"
        );

        Ok(Arc::new(Registry {
            schemas,
            storages: self.storages,
            local_caches: self.local_caches,
            shared_caches: self.shared_caches,
            publisher: self
                .publisher
                .unwrap_or_else(|| Arc::new(LoggingEventPublisher::new())),
            referrers,
            metrics: self.metrics.unwrap_or_default(),
            flush_config: self.flush_config,
        }))
    }
}

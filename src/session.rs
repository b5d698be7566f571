//! Request-scoped Session
//!
//! A [`Session`] is the application's entry point for reads and writes.
//! Sessions are cheap: they share the registry, its pools and cache tiers,
//! and only own the optional data loader and the transactions they opened.
//!
//! ```ignore
//! let mut session = registry.session();
//!
//! let mut user = User::new("Tom", 18);
//! session.flush_one(&mut user).await?;
//!
//! let loaded: Option<User> = session.load_by_id(user.id, &["Friend"]).await?;
//! let (page, total) = session
//!     .cached_search::<User>("IndexAge", &Pager::first(100), &[18.into()], &[])
//!     .await?;
//! ```

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::cache::LocalCache;
use crate::connection::{OpenTransaction, Transactions};
use crate::dirty::compute_dirty;
use crate::domain::events::QueueEvent;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::flush::{self, apply_lazy, Effects, FlushContext, FlushMode};
use crate::read::{self, Pager, ReadContext};
use crate::schema::Registry;
use crate::value::Value;

/// Unit of work against a registry
pub struct Session {
    registry: Arc<Registry>,
    data_loader: Option<Arc<LocalCache>>,
    /// Transactions this session holds, by pool
    transactions: Transactions,
}

impl Session {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            data_loader: None,
            transactions: Transactions::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn read_context(&self) -> ReadContext<'_> {
        ReadContext {
            registry: &self.registry,
            loader: self.data_loader.as_ref(),
            transactions: Some(&self.transactions),
        }
    }

    // =========================================================================
    // Data loader
    // =========================================================================

    /// Use a request-scoped cache instead of the local tier
    pub fn enable_data_loader(&mut self) {
        if self.data_loader.is_none() {
            self.data_loader = Some(Arc::new(LocalCache::new("data-loader")));
        }
    }

    /// Drop the request-scoped cache and go back to the local tier
    pub fn disable_data_loader(&mut self) {
        self.data_loader = None;
    }

    pub fn data_loader(&self) -> Option<&Arc<LocalCache>> {
        self.data_loader.as_ref()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Persist every change of the given entities
    pub async fn flush(&mut self, entities: &mut [&mut dyn Entity]) -> Result<()> {
        self.flush_with(entities, FlushMode::Immediate).await
    }

    /// Persist one entity
    pub async fn flush_one(&mut self, entity: &mut dyn Entity) -> Result<()> {
        self.flush(&mut [entity]).await
    }

    /// Queue the changes on the lazy channel instead of executing them
    pub async fn flush_lazy(&mut self, entities: &mut [&mut dyn Entity]) -> Result<()> {
        self.flush_with(entities, FlushMode::Lazy).await
    }

    /// Mark an entity deleted and flush it
    pub async fn delete(&mut self, entity: &mut dyn Entity) -> Result<()> {
        entity.state_mut().mark_to_delete();
        self.flush_one(entity).await
    }

    /// Hard-delete an entity even when it declares a soft-delete column
    pub async fn force_delete(&mut self, entity: &mut dyn Entity) -> Result<()> {
        entity.state_mut().force_mark_to_delete();
        self.flush_one(entity).await
    }

    async fn flush_with(&mut self, entities: &mut [&mut dyn Entity], mode: FlushMode) -> Result<()> {
        let mut ctx = FlushContext {
            registry: &self.registry,
            loader: self.data_loader.as_ref(),
            transactions: &mut self.transactions,
        };
        flush::flush(&mut ctx, entities, mode).await
    }

    /// Execute a statement queued by a lazy flush
    pub async fn apply_lazy(&self, event: &QueueEvent) -> Result<()> {
        apply_lazy(&self.registry, self.data_loader.as_ref(), event).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a transaction on a storage pool. Statements and reads of this
    /// session on the pool run inside it; cache effects of its flushes wait
    /// for the commit. Other sessions are not affected.
    #[instrument(skip(self))]
    pub async fn begin(&mut self, pool: &str) -> Result<()> {
        if self.transactions.contains_key(pool) {
            return Err(Error::storage(pool, "transaction already open"));
        }
        let handle = self.registry.storage(pool)?.begin().await?;
        self.transactions.insert(
            pool.to_string(),
            OpenTransaction {
                handle,
                effects: Effects::default(),
            },
        );
        debug!("Transaction opened");
        Ok(())
    }

    /// Commit the transaction of a pool and apply its deferred effects.
    /// A failed commit leaves the transaction closed and the caches alone.
    #[instrument(skip(self))]
    pub async fn commit(&mut self, pool: &str) -> Result<()> {
        let Some(open) = self.transactions.remove(pool) else {
            return Err(Error::storage(pool, "no open transaction"));
        };
        open.handle.commit().await?;
        debug!(empty = open.effects.is_empty(), "Transaction committed");
        open.effects
            .apply(&self.registry, self.data_loader.as_ref())
            .await
    }

    /// Roll back the transaction of a pool, dropping its deferred effects
    #[instrument(skip(self))]
    pub async fn rollback(&mut self, pool: &str) -> Result<()> {
        let Some(open) = self.transactions.remove(pool) else {
            return Err(Error::storage(pool, "no open transaction"));
        };
        open.handle.rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    pub fn in_transaction(&self, pool: &str) -> bool {
        self.transactions.contains_key(pool)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Load one entity through the cache tiers
    pub async fn load_by_id<T: Entity + Default>(
        &self,
        id: u64,
        references: &[&str],
    ) -> Result<Option<T>> {
        let schema = self.registry.schema_of::<T>()?;
        read::load_by_id(self.read_context(), schema, id, true, references).await
    }

    /// Load one entity straight from storage, leaving the caches alone
    pub async fn load_by_id_from_storage<T: Entity + Default>(
        &self,
        id: u64,
        references: &[&str],
    ) -> Result<Option<T>> {
        let schema = self.registry.schema_of::<T>()?;
        read::load_by_id(self.read_context(), schema, id, false, references).await
    }

    /// Load entities in input order, with the IDs that do not exist
    pub async fn load_by_ids<T: Entity + Default>(
        &self,
        ids: &[u64],
        references: &[&str],
    ) -> Result<(Vec<T>, Vec<u64>)> {
        let schema = self.registry.schema_of::<T>()?;
        read::load_by_ids(self.read_context(), schema, ids, references).await
    }

    /// Warm reference paths on already loaded entities
    pub async fn warm_up<T: Entity>(&self, entities: &mut [T], references: &[&str]) -> Result<()> {
        read::warm_up(self.read_context(), entities, references).await
    }

    /// One page of a cached query with the total number of rows
    pub async fn cached_search<T: Entity + Default>(
        &self,
        index: &str,
        pager: &Pager,
        params: &[Value],
        references: &[&str],
    ) -> Result<(Vec<T>, usize)> {
        let schema = self.registry.schema_of::<T>()?;
        let ctx = self.read_context();
        let (ids, total) = read::search_ids(ctx, schema, index, pager, params).await?;
        let (entities, _) = read::load_by_ids(ctx, schema, &ids, references).await?;
        Ok((entities, total))
    }

    /// IDs of one page of a cached query with the total number of rows
    pub async fn cached_search_ids<T: Entity + Default>(
        &self,
        index: &str,
        pager: &Pager,
        params: &[Value],
    ) -> Result<(Vec<u64>, usize)> {
        let schema = self.registry.schema_of::<T>()?;
        read::search_ids(self.read_context(), schema, index, pager, params).await
    }

    /// First row of a cached query
    pub async fn cached_search_one<T: Entity + Default>(
        &self,
        index: &str,
        params: &[Value],
        references: &[&str],
    ) -> Result<Option<T>> {
        let (mut entities, _) = self
            .cached_search::<T>(index, &Pager::first(1), params, references)
            .await?;
        Ok(entities.pop())
    }

    /// Number of rows matched by a cached query
    pub async fn cached_search_count<T: Entity + Default>(
        &self,
        index: &str,
        params: &[Value],
    ) -> Result<usize> {
        let (_, total) = self
            .cached_search_ids::<T>(index, &Pager::first(1), params)
            .await?;
        Ok(total)
    }

    // =========================================================================
    // Inspection and maintenance
    // =========================================================================

    /// Whether the next flush would write the entity
    pub fn is_dirty(&self, entity: &dyn Entity) -> Result<bool> {
        let schema = self.registry.schema(entity.entity_name())?;
        Ok(compute_dirty(schema, entity)?.is_dirty)
    }

    /// Changed columns and their new values, `None` when clean or deleting
    pub fn dirty_bind(&self, entity: &dyn Entity) -> Result<Option<Vec<(String, Value)>>> {
        let schema = self.registry.schema(entity.entity_name())?;
        Ok(compute_dirty(schema, entity)?.bind)
    }

    /// Drop cached rows of the given IDs from every tier
    pub async fn clear_cache_by_ids<T: Entity + Default>(&self, ids: &[u64]) -> Result<()> {
        let schema = self.registry.schema_of::<T>()?;
        let mut effects = Effects::default();
        for id in ids {
            effects.delete_point(schema, *id, self.data_loader.is_some());
        }
        info!(entity = %schema.entity(), ids = ids.len(), "Clearing cached rows");
        effects.apply(&self.registry, self.data_loader.as_ref()).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("data_loader", &self.data_loader.is_some())
            .field("transactions", &self.transactions.keys().collect::<Vec<_>>())
            .finish()
    }
}

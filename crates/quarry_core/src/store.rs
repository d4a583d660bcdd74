//! The store facade.

use crate::catalog::{Entity, EntityDescriptor, EntryCatalog};
use crate::config::{Deployment, StoreConfig};
use crate::env::EnvironmentManager;
use crate::error::CoreResult;
use crate::identity::KeyValue;
use crate::repository::{Criterion, Entities, Repository};
use crate::schema::{HandleCache, HandleStats};
use crate::transaction::{CommitScheduler, PendingTransaction};
use crate::workers::WorkerPool;
use parking_lot::RwLock;
use quarry_engine::{EnvStats, Environment};
use std::path::Path;
use std::slice;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

enum Handles {
    Shared(Arc<HandleCache>),
    PerWorker(WorkerPool),
}

pub(crate) struct StoreInner {
    env: Environment,
    catalog: Arc<EntryCatalog>,
    handles: Handles,
    config: StoreConfig,
    scheduler: RwLock<Option<Arc<dyn CommitScheduler>>>,
    manager: &'static EnvironmentManager,
}

impl StoreInner {
    pub(crate) fn handles(&self) -> Arc<HandleCache> {
        match &self.handles {
            Handles::Shared(cache) => Arc::clone(cache),
            Handles::PerWorker(pool) => pool.current(),
        }
    }

    pub(crate) fn catalog(&self) -> &EntryCatalog {
        &self.catalog
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> Option<Arc<dyn CommitScheduler>> {
        self.scheduler.read().clone()
    }
}

/// Counters exposed by [`Store::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Engine counters.
    pub env: EnvStats,
    /// Handle cache counters, summed over workers.
    pub handles: HandleStats,
    /// Worker handle sets (1 in shared mode).
    pub workers: usize,
    /// Described entity types.
    pub entities: usize,
}

/// Typed entity storage in one environment directory.
///
/// ```rust,no_run
/// use quarry_core::{Entity, EntitySchema, Store, StoreConfig};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Note {
///     id: i64,
///     text: String,
/// }
///
/// impl Entity for Note {
///     fn schema() -> EntitySchema<Self> {
///         EntitySchema::new("Note").key_i64("id", |n: &Note| n.id)
///     }
/// }
///
/// let store = Store::open("notes", StoreConfig::default())?;
/// let mut txn = store.begin();
/// txn.insert(&Note { id: 1, text: "hello".into() })?;
/// assert!(txn.commit()?.is_committed());
/// assert!(store.get::<Note>(1i64)?.is_some());
/// store.close_all()?;
/// # Ok::<(), quarry_core::CoreError>(())
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.env.path())
            .field("deployment", &self.inner.config.deployment)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens the store in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment cannot be created or recovered.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> CoreResult<Self> {
        Self::open_with(path.as_ref(), config, None, EnvironmentManager::global())
    }

    /// Opens an encrypted store. The password is wiped once the environment
    /// is open.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open), plus `InvalidPassword` and
    /// `EncryptionMismatch` from the engine.
    pub fn open_encrypted(path: impl AsRef<Path>, config: StoreConfig, password: impl Into<String>) -> CoreResult<Self> {
        let password = Zeroizing::new(password.into());
        Self::open_with(path.as_ref(), config, Some(password), EnvironmentManager::global())
    }

    /// Opens through a specific environment registry.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open).
    pub fn open_with(
        path: &Path,
        config: StoreConfig,
        password: Option<Zeroizing<String>>,
        manager: &'static EnvironmentManager,
    ) -> CoreResult<Self> {
        let env = manager.open(path, &config, password)?;
        let catalog = Arc::new(EntryCatalog::new());
        let handles = match config.deployment {
            Deployment::Shared => Handles::Shared(Arc::new(HandleCache::new(
                env.clone(),
                Arc::clone(&catalog),
                config.create_if_missing,
            ))),
            Deployment::PerWorker => Handles::PerWorker(WorkerPool::new(
                env.clone(),
                Arc::clone(&catalog),
                config.create_if_missing,
            )),
        };
        info!(path = %env.path().display(), deployment = ?config.deployment, "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                env,
                catalog,
                handles,
                config,
                scheduler: RwLock::new(None),
                manager,
            }),
        })
    }

    /// Environment directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.env.path()
    }

    /// Configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The engine environment.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.inner.env
    }

    /// Entity catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<EntryCatalog> {
        &self.inner.catalog
    }

    /// Handle cache for the calling thread.
    #[must_use]
    pub fn handles(&self) -> Arc<HandleCache> {
        self.inner.handles()
    }

    /// Describes `E` and builds its indices now instead of at first commit.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid schema, or an engine
    /// error if a database cannot be opened or populated.
    pub fn register<E: Entity>(&self) -> CoreResult<Arc<EntityDescriptor>> {
        let descriptor = self.inner.catalog.describe::<E>()?;
        self.handles().prepare(slice::from_ref(&descriptor))?;
        Ok(descriptor)
    }

    /// Starts a transaction.
    #[must_use]
    pub fn begin(&self) -> PendingTransaction {
        PendingTransaction::new(Arc::clone(&self.inner))
    }

    /// Sets where dropped open transactions are committed.
    pub fn set_scheduler(&self, scheduler: Option<Arc<dyn CommitScheduler>>) {
        *self.inner.scheduler.write() = scheduler;
    }

    /// Every stored `E`, in identity order.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema is invalid or the primary cannot be read.
    pub fn all<E: Entity>(&self) -> CoreResult<Entities<E>> {
        let descriptor = self.inner.catalog.describe::<E>()?;
        let cache = self.handles();
        Ok(Entities::new(Repository::new(&cache).read_all(&descriptor)?))
    }

    /// The `E` with identity `key`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `key` has the wrong identity shape.
    pub fn get<E: Entity>(&self, key: impl Into<KeyValue>) -> CoreResult<Option<E>> {
        let descriptor = self.inner.catalog.describe::<E>()?;
        let cache = self.handles();
        Repository::new(&cache)
            .read_by_key(&descriptor, &key.into())?
            .map(|payload| E::decode(&payload))
            .transpose()
    }

    /// Every `E` whose indexed `field` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `field` is not indexed.
    pub fn find<E: Entity>(&self, field: &str, value: impl Into<KeyValue>) -> CoreResult<Entities<E>> {
        let descriptor = self.inner.catalog.describe::<E>()?;
        let cache = self.handles();
        let payloads = Repository::new(&cache).read_by_index(&descriptor, field, &value.into())?;
        Ok(Entities::new(payloads))
    }

    /// Every `E` matching all `criteria`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a criterion is not on an index (or
    /// the identity, when alone).
    pub fn query<E: Entity>(&self, criteria: &[Criterion]) -> CoreResult<Entities<E>> {
        let descriptor = self.inner.catalog.describe::<E>()?;
        let cache = self.handles();
        let payloads = Repository::new(&cache).read_by_join(&descriptor, criteria)?;
        Ok(Entities::new(payloads))
    }

    /// Writes committed data to the database files and empties the log.
    ///
    /// # Errors
    ///
    /// Returns an error if a checkpoint fails.
    pub fn sync_all(&self) -> CoreResult<()> {
        match &self.inner.handles {
            Handles::Shared(cache) => cache.sync(),
            Handles::PerWorker(pool) if !pool.is_empty() => pool.sync_all(),
            Handles::PerWorker(_) => {
                self.inner.env.checkpoint()?;
                Ok(())
            }
        }
    }

    /// Current counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is closed.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        let (handles, workers) = match &self.inner.handles {
            Handles::Shared(cache) => (cache.stats(), 1),
            Handles::PerWorker(pool) => (pool.stats(), pool.len()),
        };
        Ok(StoreStats {
            env: self.inner.env.stats()?,
            handles,
            workers,
            entities: self.inner.catalog.len(),
        })
    }

    /// Closes secondary handles, then primary handles, then the environment.
    /// Other stores over the same directory share the environment and are
    /// closed with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint fails.
    pub fn close_all(&self) -> CoreResult<()> {
        match &self.inner.handles {
            Handles::Shared(cache) => cache.close_handles(),
            Handles::PerWorker(pool) => pool.close_all(),
        }
        self.inner.manager.close(&self.inner.env)?;
        info!(path = %self.inner.env.path().display(), "store closed");
        Ok(())
    }
}

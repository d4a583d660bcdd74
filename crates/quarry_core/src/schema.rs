//! Per-environment cache of open database handles.
//!
//! Every entity maps to one primary database named after it, and every
//! declared index to a secondary named `{entity}-->{field}`. The cache hands
//! out one shared handle per name. Lookups never block on I/O: a miss opens
//! the database outside any lock and then races to insert it; the loser's
//! handle is closed and the winner returned.

use crate::catalog::{EntityDescriptor, EntryCatalog};
use crate::error::{CoreError, CoreResult};
use crate::index;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use quarry_engine::{Database, DbConfig, Duplicates, Environment, Txn};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Counters exposed by [`HandleCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleStats {
    /// Cached primary handles.
    pub primaries: usize,
    /// Cached secondary handles.
    pub secondaries: usize,
    /// Primary opens performed, including discarded ones.
    pub primary_opens: u64,
    /// Secondary opens performed, including discarded ones.
    pub secondary_opens: u64,
    /// Handles opened by a thread that lost the insert race.
    pub discarded: u64,
    /// Entities whose indices have been built.
    pub prepared: usize,
}

#[derive(Default)]
struct Counters {
    primary_opens: AtomicU64,
    secondary_opens: AtomicU64,
    discarded: AtomicU64,
}

/// Open handles for one environment.
pub struct HandleCache {
    env: Environment,
    catalog: Arc<EntryCatalog>,
    create: bool,
    primaries: DashMap<String, Arc<Database>>,
    secondaries: DashMap<String, Arc<Database>>,
    prepared: Mutex<HashSet<String>>,
    counters: Counters,
}

impl fmt::Debug for HandleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCache")
            .field("env", &self.env.path())
            .field("primaries", &self.primaries.len())
            .field("secondaries", &self.secondaries.len())
            .finish_non_exhaustive()
    }
}

impl HandleCache {
    /// Creates an empty cache. With `create` false, databases must already
    /// exist.
    #[must_use]
    pub fn new(env: Environment, catalog: Arc<EntryCatalog>, create: bool) -> Self {
        Self {
            env,
            catalog,
            create,
            primaries: DashMap::new(),
            secondaries: DashMap::new(),
            prepared: Mutex::new(HashSet::new()),
            counters: Counters::default(),
        }
    }

    /// The environment the handles belong to.
    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The entity catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<EntryCatalog> {
        &self.catalog
    }

    fn db_config(&self) -> DbConfig {
        let config = if self.create {
            DbConfig::create()
        } else {
            DbConfig::existing()
        };
        config.encrypted(self.env.is_encrypted())
    }

    /// Primary handle for `entity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn primary_handle(&self, entity: &str) -> CoreResult<Arc<Database>> {
        self.open_cached(&self.primaries, entity, self.db_config(), &self.counters.primary_opens)
    }

    /// Secondary handle `{primary}-->{index}`. Taking the primary handle
    /// guarantees it is opened first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or its stored
    /// duplicate policy differs.
    pub fn secondary_handle(&self, primary: &Database, index: &str, duplicates: Duplicates) -> CoreResult<Arc<Database>> {
        self.open_cached(
            &self.secondaries,
            &format!("{}-->{index}", primary.name()),
            self.db_config().duplicates(duplicates),
            &self.counters.secondary_opens,
        )
    }

    /// Secondary handle for the index `descriptor` declares over `field`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `field` is not indexed.
    pub fn index_handle(&self, descriptor: &EntityDescriptor, field: &str) -> CoreResult<Arc<Database>> {
        let duplicates = descriptor.index_duplicates(field).ok_or_else(|| {
            CoreError::configuration(format!("{}.{field} is not indexed", descriptor.name()))
        })?;
        let primary = self.primary_handle(descriptor.name())?;
        self.secondary_handle(&primary, field, duplicates)
    }

    fn open_cached(
        &self,
        map: &DashMap<String, Arc<Database>>,
        name: &str,
        config: DbConfig,
        opens: &AtomicU64,
    ) -> CoreResult<Arc<Database>> {
        if let Some(found) = map.get(name) {
            return Ok(Arc::clone(found.value()));
        }

        let opened = Arc::new(self.env.open_database(name, config)?);
        opens.fetch_add(1, Ordering::Relaxed);
        let (winner, loser) = match map.entry(name.to_string()) {
            Entry::Occupied(held) => (Arc::clone(held.get()), Some(opened)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&opened));
                (opened, None)
            }
        };
        if let Some(loser) = loser {
            loser.close();
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(database = name, "discarded duplicate handle");
        } else {
            debug!(database = name, "cached handle");
        }
        Ok(winner)
    }

    /// Builds the indices of every entity in `descriptors` not yet prepared,
    /// plus those of already described entities that reference them.
    ///
    /// # Errors
    ///
    /// Returns the first build failure. Entities prepared before it stay
    /// prepared.
    pub fn prepare(&self, descriptors: &[Arc<EntityDescriptor>]) -> CoreResult<()> {
        let mut prepared = self.prepared.lock();
        let mut pending: Vec<Arc<EntityDescriptor>> = descriptors.to_vec();
        while let Some(descriptor) = pending.pop() {
            if prepared.contains(descriptor.name()) {
                continue;
            }
            let built = index::build(self, &descriptor)?;
            prepared.insert(descriptor.name().to_string());
            info!(entity = descriptor.name(), indices = built, "prepared entity");
            pending.extend(self.catalog.referencing(descriptor.name()));
        }
        Ok(())
    }

    /// Prepares `descriptors` and begins an engine transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if preparation fails or the environment is closed.
    pub fn prepare_for_transaction(&self, descriptors: &[Arc<EntityDescriptor>]) -> CoreResult<Txn> {
        self.prepare(descriptors)?;
        Ok(self.env.begin()?)
    }

    /// True once the indices of `entity` have been built by this cache.
    #[must_use]
    pub fn is_prepared(&self, entity: &str) -> bool {
        self.prepared.lock().contains(entity)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> HandleStats {
        HandleStats {
            primaries: self.primaries.len(),
            secondaries: self.secondaries.len(),
            primary_opens: self.counters.primary_opens.load(Ordering::Relaxed),
            secondary_opens: self.counters.secondary_opens.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            prepared: self.prepared.lock().len(),
        }
    }

    /// Checkpoints the environment: every database image is written and the
    /// log is emptied.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.env.checkpoint()?;
        Ok(())
    }

    /// Closes every secondary handle, then every primary handle. The
    /// environment stays open.
    pub fn close_handles(&self) {
        let mut prepared = self.prepared.lock();
        for entry in self.secondaries.iter() {
            entry.value().close();
        }
        self.secondaries.clear();
        for entry in self.primaries.iter() {
            entry.value().close();
        }
        self.primaries.clear();
        prepared.clear();
        debug!(env = %self.env.path().display(), "closed cached handles");
    }
}

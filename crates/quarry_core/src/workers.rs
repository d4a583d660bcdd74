//! Per-worker handle sets.
//!
//! In [`Deployment::PerWorker`](crate::Deployment::PerWorker) mode engine
//! handles are bound to the thread that opened them, so every worker thread
//! gets its own [`HandleCache`] over the shared environment. Caches are
//! created lazily on a thread's first request.

use crate::catalog::EntryCatalog;
use crate::error::CoreResult;
use crate::schema::{HandleCache, HandleStats};
use dashmap::DashMap;
use quarry_engine::Environment;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;

/// Handle caches keyed by worker thread.
#[derive(Debug)]
pub struct WorkerPool {
    env: Environment,
    catalog: Arc<EntryCatalog>,
    create: bool,
    workers: DashMap<ThreadId, Arc<HandleCache>>,
}

impl WorkerPool {
    /// Creates a pool with no workers.
    #[must_use]
    pub fn new(env: Environment, catalog: Arc<EntryCatalog>, create: bool) -> Self {
        Self {
            env,
            catalog,
            create,
            workers: DashMap::new(),
        }
    }

    /// The calling thread's cache.
    #[must_use]
    pub fn current(&self) -> Arc<HandleCache> {
        let id = thread::current().id();
        let cache = self.workers.entry(id).or_insert_with(|| {
            debug!(worker = ?id, "starting worker handle set");
            Arc::new(HandleCache::new(self.env.clone(), Arc::clone(&self.catalog), self.create))
        });
        Arc::clone(cache.value())
    }

    /// Workers that have opened a handle set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True before any worker asked for handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn snapshot(&self) -> Vec<(ThreadId, Arc<HandleCache>)> {
        self.workers
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    /// Calls `f` with every worker's cache, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error `f` returns.
    pub fn for_each_worker_handle<F>(&self, mut f: F) -> CoreResult<()>
    where
        F: FnMut(ThreadId, &HandleCache) -> CoreResult<()>,
    {
        for (id, cache) in self.snapshot() {
            f(id, &cache)?;
        }
        Ok(())
    }

    /// Flushes through every worker's cache.
    ///
    /// # Errors
    ///
    /// Returns the first checkpoint failure.
    pub fn sync_all(&self) -> CoreResult<()> {
        self.for_each_worker_handle(|_, cache| cache.sync())
    }

    /// Closes every worker's handles and forgets the workers.
    pub fn close_all(&self) {
        for (_, cache) in self.snapshot() {
            cache.close_handles();
        }
        self.workers.clear();
    }

    /// Counters summed over all workers.
    #[must_use]
    pub fn stats(&self) -> HandleStats {
        self.snapshot()
            .iter()
            .map(|(_, cache)| cache.stats())
            .fold(HandleStats::default(), |mut sum, s| {
                sum.primaries += s.primaries;
                sum.secondaries += s.secondaries;
                sum.primary_opens += s.primary_opens;
                sum.secondary_opens += s.secondary_opens;
                sum.discarded += s.discarded;
                sum.prepared += s.prepared;
                sum
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_engine::{EngineError, EnvConfig, OpenFlags};
    use tempfile::tempdir;

    fn pool() -> (tempfile::TempDir, Arc<WorkerPool>) {
        let dir = tempdir().unwrap();
        let config = EnvConfig::default().free_threaded(false);
        let env = Environment::open(dir.path(), config, OpenFlags::create(), None).unwrap();
        (dir, Arc::new(WorkerPool::new(env, Arc::new(EntryCatalog::new()), true)))
    }

    #[test]
    fn each_thread_gets_its_own_cache() {
        let (_dir, pool) = pool();
        let here = pool.current();
        assert!(Arc::ptr_eq(&here, &pool.current()));

        let remote = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.current()).join().unwrap()
        };
        assert!(!Arc::ptr_eq(&here, &remote));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn handles_stay_on_their_thread() {
        let (_dir, pool) = pool();
        let foreign = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.current().primary_handle("Item").unwrap())
                .join()
                .unwrap()
        };
        let err = foreign.len().unwrap_err();
        assert!(matches!(err, EngineError::WrongThread { .. }));

        let local = pool.current().primary_handle("Item").unwrap();
        assert!(local.is_empty().unwrap());
    }

    #[test]
    fn sync_and_close_visit_every_worker() {
        let (_dir, pool) = pool();
        pool.current().primary_handle("Item").unwrap();
        {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.current().primary_handle("Item").unwrap();
            })
            .join()
            .unwrap();
        }
        assert_eq!(pool.stats().primaries, 2);

        let mut visited = 0;
        pool.for_each_worker_handle(|_, _| {
            visited += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(visited, 2);
        pool.sync_all().unwrap();

        pool.close_all();
        assert!(pool.is_empty());
        assert_eq!(pool.stats(), HandleStats::default());
    }
}

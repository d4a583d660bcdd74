//! Store configuration.

use quarry_engine::{DeadlockPolicy, EnvConfig};
use std::time::Duration;

/// Commit attempts before a contended transaction is given up.
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 6;

/// How engine handles are shared between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deployment {
    /// One handle set, used from every thread.
    #[default]
    Shared,
    /// Each worker thread lazily opens its own handle set. Handles stay bound
    /// to the thread that opened them.
    PerWorker,
}

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Create the directory and missing databases on demand.
    pub create_if_missing: bool,
    /// Memory pool budget in bytes.
    pub cache_size: u64,
    /// Log buffer size in bytes.
    pub log_buffer_size: usize,
    /// Deadlock victim selection.
    pub deadlock_policy: DeadlockPolicy,
    /// Per-lock wait bound.
    pub lock_timeout: Option<Duration>,
    /// Sync the log on every commit.
    pub sync_on_commit: bool,
    /// Handle sharing between threads.
    pub deployment: Deployment,
    /// Commit attempts for a transaction that keeps hitting contention.
    pub max_commit_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let env = EnvConfig::default();
        Self {
            create_if_missing: true,
            cache_size: env.cache_size,
            log_buffer_size: env.log_buffer_size,
            deadlock_policy: env.deadlock_policy,
            lock_timeout: env.lock_timeout,
            sync_on_commit: env.sync_on_commit,
            deployment: Deployment::Shared,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether missing directories and databases are created.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the memory pool budget.
    #[must_use]
    pub const fn cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Sets the log buffer size.
    #[must_use]
    pub const fn log_buffer_size(mut self, bytes: usize) -> Self {
        self.log_buffer_size = bytes;
        self
    }

    /// Sets the deadlock victim policy.
    #[must_use]
    pub const fn deadlock_policy(mut self, policy: DeadlockPolicy) -> Self {
        self.deadlock_policy = policy;
        self
    }

    /// Sets the lock wait bound.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether each commit syncs the log.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the deployment mode.
    #[must_use]
    pub const fn deployment(mut self, deployment: Deployment) -> Self {
        self.deployment = deployment;
        self
    }

    /// Sets the commit attempt bound. Zero is treated as one.
    #[must_use]
    pub const fn max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    pub(crate) fn env_config(&self) -> EnvConfig {
        EnvConfig::new()
            .cache_size(self.cache_size)
            .log_buffer_size(self.log_buffer_size)
            .deadlock_policy(self.deadlock_policy)
            .lock_timeout(self.lock_timeout)
            .sync_on_commit(self.sync_on_commit)
            .free_threaded(self.deployment == Deployment::Shared)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.max_commit_attempts.max(1)
    }
}

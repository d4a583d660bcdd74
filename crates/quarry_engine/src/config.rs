//! Environment and database configuration.

use std::time::Duration;

/// How the lock manager picks a victim when a wait closes a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlockPolicy {
    /// Abort the transaction holding the fewest write locks, so the least
    /// work is lost. Ties go to the youngest transaction.
    #[default]
    MinWrite,
    /// Abort the most recently started transaction.
    Youngest,
    /// Abort the longest running transaction.
    Oldest,
}

/// Duplicate-key policy of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Duplicates {
    /// Each key maps to exactly one value.
    #[default]
    None,
    /// A key may map to many values, kept in insertion order.
    Unsorted,
    /// A key may map to many values, kept in byte order.
    Sorted,
}

impl Duplicates {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Unsorted => 1,
            Self::Sorted => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Unsorted),
            2 => Some(Self::Sorted),
            _ => None,
        }
    }

    /// Whether the policy admits more than one value per key.
    #[must_use]
    pub fn allows_duplicates(self) -> bool {
        self != Self::None
    }
}

/// What happens when a parent record referenced by a foreign-key secondary is
/// deleted while children still point at it.
///
/// Only `Abort` is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForeignDeleteAction {
    /// Reject the delete with [`EngineError::ForeignConflict`](crate::EngineError::ForeignConflict).
    #[default]
    Abort,
}

/// Environment-wide settings, applied once when the environment is opened.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Memory pool budget in bytes. Exceeding it is reported, not enforced.
    pub cache_size: u64,
    /// Bytes of log held in memory before a forced write.
    pub log_buffer_size: usize,
    /// Deadlock victim selection.
    pub deadlock_policy: DeadlockPolicy,
    /// Upper bound on a single lock wait (`None` waits until granted or
    /// chosen as a deadlock victim).
    pub lock_timeout: Option<Duration>,
    /// Sync the log on every commit.
    pub sync_on_commit: bool,
    /// Allow database handles to be used from any thread.
    pub free_threaded: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            cache_size: 64 * 1024 * 1024,  // 64 MB
            log_buffer_size: 256 * 1024,   // 256 KB
            deadlock_policy: DeadlockPolicy::MinWrite,
            lock_timeout: None,
            sync_on_commit: true,
            free_threaded: true,
        }
    }
}

impl EnvConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
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

    /// Sets the lock wait timeout.
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

    /// Sets whether handles may cross threads.
    #[must_use]
    pub const fn free_threaded(mut self, value: bool) -> Self {
        self.free_threaded = value;
        self
    }
}

/// Flags for a single environment open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Create the environment if it does not exist.
    pub create: bool,
    /// Run normal recovery: replay the log and discard a torn tail.
    pub recover: bool,
    /// Run catastrophic recovery: replay up to the first damaged record and
    /// discard everything after it, dropping unreadable database images.
    pub recover_fatal: bool,
}

impl OpenFlags {
    /// Plain open, creating the environment when missing.
    #[must_use]
    pub const fn create() -> Self {
        Self {
            create: true,
            recover: false,
            recover_fatal: false,
        }
    }

    /// Adds normal recovery.
    #[must_use]
    pub const fn with_recover(mut self) -> Self {
        self.recover = true;
        self
    }

    /// Adds catastrophic recovery.
    #[must_use]
    pub const fn with_recover_fatal(mut self) -> Self {
        self.recover_fatal = true;
        self
    }
}

/// Settings for opening one database inside an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DbConfig {
    /// Create the database when it does not exist.
    pub create: bool,
    /// Duplicate policy. Must match the stored policy for existing databases.
    pub duplicates: Duplicates,
    /// Must equal the environment's encryption state.
    pub encrypted: bool,
}

impl DbConfig {
    /// A configuration that creates the database on demand.
    #[must_use]
    pub const fn create() -> Self {
        Self {
            create: true,
            duplicates: Duplicates::None,
            encrypted: false,
        }
    }

    /// A configuration that never creates.
    #[must_use]
    pub const fn existing() -> Self {
        Self {
            create: false,
            duplicates: Duplicates::None,
            encrypted: false,
        }
    }

    /// Sets the duplicate policy.
    #[must_use]
    pub const fn duplicates(mut self, duplicates: Duplicates) -> Self {
        self.duplicates = duplicates;
        self
    }

    /// Sets the encryption flag.
    #[must_use]
    pub const fn encrypted(mut self, value: bool) -> Self {
        self.encrypted = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EnvConfig::default();
        assert_eq!(config.deadlock_policy, DeadlockPolicy::MinWrite);
        assert!(config.sync_on_commit);
        assert!(config.lock_timeout.is_none());
    }

    #[test]
    fn builders() {
        let config = EnvConfig::new()
            .cache_size(1024)
            .log_buffer_size(16)
            .free_threaded(false);
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.log_buffer_size, 16);
        assert!(!config.free_threaded);

        let flags = OpenFlags::create().with_recover();
        assert!(flags.create && flags.recover && !flags.recover_fatal);

        let db = DbConfig::existing().duplicates(Duplicates::Sorted).encrypted(true);
        assert!(!db.create);
        assert!(db.encrypted);
    }

    #[test]
    fn duplicates_byte_roundtrip() {
        for d in [Duplicates::None, Duplicates::Unsorted, Duplicates::Sorted] {
            assert_eq!(Duplicates::from_byte(d.as_byte()), Some(d));
        }
        assert_eq!(Duplicates::from_byte(9), None);
    }
}

//! Error types for the Quarry engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by engine calls.
///
/// Variants map one-to-one onto the return codes a caller has to dispatch on:
/// contention (`Deadlock`, `LockTimeout`), integrity (`KeyExist`,
/// `ForeignConflict`), configuration and resource failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] quarry_storage::StorageError),

    /// I/O error outside a storage backend (directories, lock files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transaction was chosen as a deadlock victim and must abort.
    #[error("deadlock: transaction {txid} chosen as victim")]
    Deadlock {
        /// The victim transaction.
        txid: u64,
    },

    /// A lock could not be granted within the configured timeout.
    #[error("lock wait timed out for transaction {txid}")]
    LockTimeout {
        /// The waiting transaction.
        txid: u64,
    },

    /// Put-without-overwrite found an existing key, or a unique secondary
    /// already maps the derived key to another record.
    #[error("key already exists in database {database}")]
    KeyExist {
        /// Database that rejected the write.
        database: String,
    },

    /// Key not present.
    #[error("key not found in database {database}")]
    NotFound {
        /// Database searched.
        database: String,
    },

    /// Foreign-key constraint violated.
    #[error("foreign key conflict: {message}")]
    ForeignConflict {
        /// Description of the violated constraint.
        message: String,
    },

    /// The named database does not exist and creation was not requested.
    #[error("no such database: {name}")]
    NoSuchDatabase {
        /// Database name.
        name: String,
    },

    /// The environment must be opened with a recovery flag.
    #[error("environment needs recovery: {reason}")]
    RunRecovery {
        /// Why recovery is required.
        reason: String,
    },

    /// A database or environment encryption setting disagrees with the store.
    #[error("encryption mismatch: {message}")]
    EncryptionMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// The supplied passphrase does not open the environment.
    #[error("invalid environment password")]
    InvalidPassword,

    /// Another process holds the environment lock.
    #[error("environment locked by another process")]
    EnvironmentLocked,

    /// The environment has been closed.
    #[error("environment is closed")]
    EnvironmentClosed,

    /// The handle has been closed.
    #[error("database handle {name} is closed")]
    HandleClosed {
        /// Database name.
        name: String,
    },

    /// A handle opened without free-threading was used from another thread.
    #[error("database handle {name} used outside its owning thread")]
    WrongThread {
        /// Database name.
        name: String,
    },

    /// The transaction is no longer active.
    #[error("transaction {txid} is not active")]
    TxnNotActive {
        /// Transaction id.
        txid: u64,
    },

    /// A key-extraction callback failed.
    #[error("key extractor for {database} failed: {message}")]
    Extractor {
        /// Secondary database name.
        database: String,
        /// Failure reported by the callback.
        message: String,
    },

    /// A persisted structure failed validation.
    #[error("corruption in {what}: {message}")]
    Corruption {
        /// What was being read.
        what: String,
        /// Description of the damage.
        message: String,
    },

    /// The call is not valid for this handle or configuration.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },
}

impl EngineError {
    /// Creates a foreign-key conflict error.
    pub fn foreign_conflict(message: impl Into<String>) -> Self {
        Self::ForeignConflict {
            message: message.into(),
        }
    }

    /// Creates a run-recovery error.
    pub fn run_recovery(reason: impl Into<String>) -> Self {
        Self::RunRecovery {
            reason: reason.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corruption {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Creates an encryption mismatch error.
    pub fn encryption_mismatch(message: impl Into<String>) -> Self {
        Self::EncryptionMismatch {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// True for lock conflicts that a caller may resolve by retrying the
    /// whole transaction.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Deadlock { .. } | Self::LockTimeout { .. })
    }

    /// True for constraint violations (uniqueness, referential integrity).
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::KeyExist { .. } | Self::ForeignConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(EngineError::Deadlock { txid: 1 }.is_contention());
        assert!(EngineError::LockTimeout { txid: 1 }.is_contention());
        assert!(EngineError::foreign_conflict("x").is_integrity());
        assert!(!EngineError::run_recovery("x").is_contention());
        assert!(!EngineError::NoSuchDatabase { name: "a".into() }.is_integrity());
    }
}

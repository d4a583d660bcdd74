//! Error types for Quarry.

use quarry_engine::EngineError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for Quarry operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Schema or usage mistake. Fatal, raised at first use, never retried.
    Configuration,
    /// Uniqueness or referential-integrity violation. The transaction is
    /// rolled back as a whole.
    Integrity,
    /// Lock conflict (deadlock or lock timeout). Retried up to a bound.
    Contention,
    /// The environment or a database cannot be opened, read or written.
    Resource,
}

/// Errors that can occur in Quarry operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Entity schema or API misuse.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// Payload could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A mutation or commit was attempted on a finished transaction.
    #[error("transaction is already {state}")]
    TransactionFinished {
        /// The terminal state.
        state: &'static str,
    },

    /// Every commit attempt hit lock contention.
    #[error("commit failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: EngineError,
    },

    /// The environment directory could not be created.
    #[error("cannot create environment directory {path}: {source}")]
    CreateDirectory {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Opening failed even with catastrophic recovery.
    #[error("environment {path} could not be recovered: {last}")]
    Unrecoverable {
        /// Directory path.
        path: PathBuf,
        /// Error from the final attempt.
        last: EngineError,
    },
}

impl CoreError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Engine(e) => engine_kind(e),
            Self::Configuration { .. } | Self::Codec { .. } | Self::TransactionFinished { .. } => {
                ErrorKind::Configuration
            }
            Self::RetriesExhausted { .. } => ErrorKind::Contention,
            Self::CreateDirectory { .. } | Self::Unrecoverable { .. } => ErrorKind::Resource,
        }
    }

    /// True when a retry of the whole transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_contention())
    }
}

fn engine_kind(error: &EngineError) -> ErrorKind {
    match error {
        EngineError::Deadlock { .. } | EngineError::LockTimeout { .. } => ErrorKind::Contention,
        EngineError::KeyExist { .. } | EngineError::ForeignConflict { .. } | EngineError::NotFound { .. } => {
            ErrorKind::Integrity
        }
        EngineError::NoSuchDatabase { .. }
        | EngineError::EncryptionMismatch { .. }
        | EngineError::InvalidPassword
        | EngineError::HandleClosed { .. }
        | EngineError::WrongThread { .. }
        | EngineError::TxnNotActive { .. }
        | EngineError::Extractor { .. }
        | EngineError::InvalidArgument { .. } => ErrorKind::Configuration,
        EngineError::Storage(_)
        | EngineError::Io(_)
        | EngineError::RunRecovery { .. }
        | EngineError::EnvironmentLocked
        | EngineError::EnvironmentClosed
        | EngineError::Corruption { .. } => ErrorKind::Resource,
    }
}

//! Backend errors.

use std::io;
use thiserror::Error;

/// Result alias used by every backend.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a byte-store call.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system rejected a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read range ends past the stored bytes.
    #[error("read of {len} bytes at offset {offset} exceeds store size {size}")]
    ReadPastEnd {
        /// Start of the requested range.
        offset: u64,
        /// Length of the requested range.
        len: usize,
        /// Bytes currently stored.
        size: u64,
    },

    /// Truncation target lies past the current end.
    #[error("cannot truncate to {requested} bytes, store holds {size}")]
    TruncatePastEnd {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },

    /// Encrypted frames are torn or malformed.
    #[error("damaged frame: {0}")]
    Corrupted(String),

    /// A frame failed authentication or a cipher could not be built.
    #[error("cipher failure: {0}")]
    Encryption(String),
}

impl StorageError {
    /// Builds a [`StorageError::Corrupted`].
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Builds a [`StorageError::Encryption`].
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption(message.into())
    }
}

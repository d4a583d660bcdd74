//! # Quarry Storage
//!
//! Byte-store backends underneath the Quarry engine.
//!
//! Backends are **opaque byte stores**: the engine owns every file format
//! (log records, database images, the encryption verifier) and a backend only
//! reads, appends, replaces and syncs bytes.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral storage for tests
//! - [`FileBackend`] - persistent storage using OS file APIs
//! - [`EncryptedBackend`] - AES-256-GCM wrapper around any other backend
//!
//! ## Example
//!
//! ```rust
//! use quarry_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod encrypted;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use encrypted::{EncryptedBackend, EncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;

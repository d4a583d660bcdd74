//! # Quarry Engine
//!
//! An embedded transactional key-value engine: named B-tree databases inside
//! a shared environment, secondary databases maintained through key
//! extractors, foreign-key constraints, record locking with deadlock
//! detection, a write-ahead log with recovery, and optional AES-256-GCM
//! encryption.
//!
//! ## Example
//!
//! ```rust,no_run
//! use quarry_engine::{DbConfig, Duplicates, EnvConfig, Environment, OpenFlags};
//! use std::sync::Arc;
//!
//! let env = Environment::open("data".as_ref(), EnvConfig::default(), OpenFlags::create(), None)?;
//! let orders = env.open_database("Order", DbConfig::create())?;
//! let by_customer = env.open_database(
//!     "Order-->customer",
//!     DbConfig::create().duplicates(Duplicates::Sorted),
//! )?;
//! orders.associate(
//!     &by_customer,
//!     Arc::new(|_key: &[u8], value: &[u8]| -> Result<Option<Vec<u8>>, String> {
//!         Ok(value.split(|b| *b == b':').next().map(<[u8]>::to_vec))
//!     }),
//! )?;
//!
//! let mut txn = env.begin()?;
//! orders.put_no_overwrite(&mut txn, b"o1", b"c1:widget")?;
//! txn.commit()?;
//!
//! let mut cursor = by_customer.cursor()?;
//! assert!(cursor.set(b"c1").is_some());
//! # Ok::<(), quarry_engine::EngineError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod config;
mod crypto;
mod cursor;
mod database;
mod dir;
mod env;
mod error;
mod lock;
mod log;
mod tree;
mod txn;
mod types;

pub use config::{DbConfig, DeadlockPolicy, Duplicates, EnvConfig, ForeignDeleteAction, OpenFlags};
pub use cursor::{Cursor, JoinCursor};
pub use database::{Database, KeyExtractor};
pub use env::{EnvStats, Environment};
pub use error::{EngineError, EngineResult};
pub use txn::{Txn, TxnState};
pub use types::TxnId;

/// Re-exported so callers can hand over passphrases without a direct
/// dependency on `zeroize`.
pub use zeroize::Zeroizing;

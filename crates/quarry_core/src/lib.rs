//! # Quarry
//!
//! Typed entity storage over the Quarry engine.
//!
//! Entities describe their identity, readable fields, secondary keys and
//! foreign keys once through [`Entity::schema`]. A [`Store`] maps each entity
//! to a primary database and each declared key to a secondary database,
//! opens those lazily and keeps one handle per database. Writes are queued
//! in a [`PendingTransaction`] and applied atomically at commit, with the
//! whole queue replayed when the engine picks the transaction as a deadlock
//! victim.
//!
//! ## Example
//!
//! ```rust,no_run
//! use quarry_core::{Criterion, Entity, EntitySchema, SecondaryKeyDeclaration, Store, StoreConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Product {
//!     sku: String,
//!     category: String,
//!     color: String,
//! }
//!
//! impl Entity for Product {
//!     fn schema() -> EntitySchema<Self> {
//!         EntitySchema::new("Product")
//!             .key_bytes("sku", |p: &Product| p.sku.as_bytes().to_vec())
//!             .field("category", |p: &Product| Some(p.category.clone().into()))
//!             .field("color", |p: &Product| Some(p.color.clone().into()))
//!             .secondary_key("category", SecondaryKeyDeclaration::non_unique())
//!             .secondary_key("color", SecondaryKeyDeclaration::non_unique())
//!     }
//! }
//!
//! let store = Store::open("catalog", StoreConfig::default())?;
//! let mut txn = store.begin();
//! txn.insert(&Product { sku: "T-1".into(), category: "shirt".into(), color: "red".into() })?;
//! txn.commit()?;
//!
//! let red_shirts: Vec<Product> = store
//!     .query::<Product>(&[Criterion::new("category", "shirt"), Criterion::new("color", "red")])?
//!     .collect::<Result<_, _>>()?;
//! assert_eq!(red_shirts.len(), 1);
//! # Ok::<(), quarry_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod codec;
mod config;
mod env;
mod error;
mod identity;
mod index;
mod repository;
mod schema;
mod store;
mod transaction;
mod workers;

pub use catalog::{
    Entity, EntityDescriptor, EntitySchema, EntryCatalog, ForeignKeyDeclaration, IdentityShape, RelationKind,
    SecondaryKeyDeclaration,
};
pub use codec::{CborCodec, PayloadCodec};
pub use config::{Deployment, StoreConfig, DEFAULT_MAX_COMMIT_ATTEMPTS};
pub use env::EnvironmentManager;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use identity::KeyValue;
pub use repository::{Criterion, Entities, Payloads, Repository};
pub use schema::{HandleCache, HandleStats};
pub use store::{Store, StoreStats};
pub use transaction::{Action, CommitScheduler, CommitStatus, PendingTransaction, TransactionElement, TransactionState};
pub use workers::WorkerPool;

pub use quarry_engine::{DeadlockPolicy, Duplicates};
pub use zeroize::Zeroizing;

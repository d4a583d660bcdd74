//! Shared fixtures for integration tests.
#![allow(dead_code)]

use quarry_core::{
    Entity, EntitySchema, ForeignKeyDeclaration, RelationKind, SecondaryKeyDeclaration, Store, StoreConfig,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open_store() -> (TempDir, Store) {
    open_store_with(StoreConfig::default())
}

pub fn open_store_with(config: StoreConfig) -> (TempDir, Store) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), config).unwrap();
    (dir, store)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

impl Entity for Customer {
    fn schema() -> EntitySchema<Self> {
        EntitySchema::new("Customer")
            .key_guid("id", |c: &Customer| c.id)
            .field("email", |c: &Customer| Some(c.email.clone().into()))
            .secondary_key("email", SecondaryKeyDeclaration::unique())
    }
}

pub fn customer(name: &str) -> Customer {
    Customer {
        id: Uuid::new_v4(),
        name: name.to_string(),
        email: format!("{name}@example.com"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub customer_id: Uuid,
    pub status: String,
}

impl Entity for Order {
    fn schema() -> EntitySchema<Self> {
        EntitySchema::new("Order")
            .key_i64("id", |o: &Order| o.id)
            .field("customer_id", |o: &Order| Some(o.customer_id.into()))
            .field("status", |o: &Order| Some(o.status.clone().into()))
            .foreign_key(
                "customer_id",
                ForeignKeyDeclaration::new("Customer", RelationKind::ManyToOne).navigation("customer"),
            )
            .secondary_key("status", SecondaryKeyDeclaration::non_unique())
    }
}

pub fn order(id: i64, customer: &Customer, status: &str) -> Order {
    Order {
        id,
        customer_id: customer.id,
        status: status.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub category: String,
    pub color: String,
}

impl Entity for Product {
    fn schema() -> EntitySchema<Self> {
        EntitySchema::new("Product")
            .key_bytes("sku", |p: &Product| p.sku.as_bytes().to_vec())
            .field("category", |p: &Product| Some(p.category.clone().into()))
            .field("color", |p: &Product| Some(p.color.clone().into()))
            .secondary_key("category", SecondaryKeyDeclaration::non_unique())
            .secondary_key("color", SecondaryKeyDeclaration::non_unique())
    }
}

pub fn product(sku: &str, category: &str, color: &str) -> Product {
    Product {
        sku: sku.to_string(),
        category: category.to_string(),
        color: color.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: i32,
    pub value: u64,
}

impl Entity for Counter {
    fn schema() -> EntitySchema<Self> {
        EntitySchema::new("Counter").key_i32("id", |c: &Counter| c.id)
    }
}

pub fn commit_all<E: Entity>(store: &Store, entities: &[E]) {
    let mut txn = store.begin();
    for entity in entities {
        txn.insert(entity).unwrap();
    }
    assert!(txn.commit().unwrap().is_committed());
}

pub fn collect<E: Entity>(entities: quarry_core::Entities<E>) -> Vec<E> {
    entities.map(Result::unwrap).collect()
}

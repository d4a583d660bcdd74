mod common;

use common::{collect, commit_all, open_store, product, Product};
use quarry_core::{Criterion, ErrorKind};

fn seed() -> (tempfile::TempDir, quarry_core::Store) {
    let (dir, store) = open_store();
    commit_all(
        &store,
        &[
            product("A-1", "shirt", "red"),
            product("A-2", "shirt", "blue"),
            product("B-1", "hat", "red"),
            product("B-2", "hat", "green"),
            product("C-1", "shirt", "red"),
        ],
    );
    (dir, store)
}

fn skus(products: Vec<Product>) -> Vec<String> {
    let mut skus: Vec<String> = products.into_iter().map(|p| p.sku).collect();
    skus.sort();
    skus
}

#[test]
fn join_returns_only_records_matching_every_criterion() {
    let (_dir, store) = seed();
    let found = collect(
        store
            .query::<Product>(&[Criterion::new("category", "shirt"), Criterion::new("color", "red")])
            .unwrap(),
    );
    assert_eq!(skus(found), vec!["A-1", "C-1"]);

    let hats = collect(
        store
            .query::<Product>(&[Criterion::new("color", "red"), Criterion::new("category", "hat")])
            .unwrap(),
    );
    assert_eq!(skus(hats), vec!["B-1"]);
}

#[test]
fn join_on_an_absent_value_is_empty_and_holds_no_cursors() {
    let (_dir, store) = seed();
    let result = store
        .query::<Product>(&[Criterion::new("category", "shirt"), Criterion::new("color", "purple")])
        .unwrap();
    assert_eq!(result.count(), 0);

    let product = store.catalog().describe::<Product>().unwrap();
    let cache = store.handles();
    assert_eq!(cache.primary_handle("Product").unwrap().open_cursors(), 0);
    assert_eq!(cache.index_handle(&product, "category").unwrap().open_cursors(), 0);
    assert_eq!(cache.index_handle(&product, "color").unwrap().open_cursors(), 0);
}

#[test]
fn single_criterion_forms() {
    let (_dir, store) = seed();
    let by_key = collect(store.query::<Product>(&[Criterion::new("sku", b"B-2".to_vec())]).unwrap());
    assert_eq!(by_key, vec![product("B-2", "hat", "green")]);

    let by_index = collect(store.query::<Product>(&[Criterion::new("color", "green")]).unwrap());
    assert_eq!(skus(by_index), vec!["B-2"]);

    let missing = collect(store.query::<Product>(&[Criterion::new("sku", b"Z-9".to_vec())]).unwrap());
    assert!(missing.is_empty());
}

#[test]
fn full_scans_restart_from_the_first_key() {
    let (_dir, store) = seed();
    let mut partial = store.query::<Product>(&[]).unwrap();
    assert_eq!(partial.next().unwrap().unwrap().sku, "A-1");
    drop(partial);

    let first: Vec<String> = collect(store.all::<Product>().unwrap()).into_iter().map(|p| p.sku).collect();
    let second: Vec<String> = collect(store.all::<Product>().unwrap()).into_iter().map(|p| p.sku).collect();
    assert_eq!(first, vec!["A-1", "A-2", "B-1", "B-2", "C-1"]);
    assert_eq!(first, second);
}

#[test]
fn unindexed_fields_are_configuration_errors() {
    let (_dir, store) = seed();
    let err = store.find::<Product>("sku", "A-1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = store
        .query::<Product>(&[Criterion::new("weight", 3i32), Criterion::new("color", "red")])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

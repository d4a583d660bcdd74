mod common;

use common::{collect, commit_all, open_store_with, product, Counter, Product};
use quarry_core::{Criterion, Deployment, ErrorKind, Store, StoreConfig};
use std::thread;

#[test]
fn workers_use_their_own_handles_over_one_environment() {
    let (_dir, store) = open_store_with(StoreConfig::default().deployment(Deployment::PerWorker));

    let workers: Vec<_> = (0..3)
        .map(|w| {
            let store = store.clone();
            thread::spawn(move || {
                let mut txn = store.begin();
                for i in 0..4 {
                    let color = if i % 2 == 0 { "red" } else { "blue" };
                    txn.insert(&product(&format!("W{w}-{i}"), "shirt", color)).unwrap();
                }
                assert!(txn.commit().unwrap().is_committed());
                store.handles().stats().primaries
            })
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), 1);
    }

    let all: Vec<Product> = collect(store.all::<Product>().unwrap());
    assert_eq!(all.len(), 12);
    let red = collect(
        store
            .query::<Product>(&[Criterion::new("category", "shirt"), Criterion::new("color", "red")])
            .unwrap(),
    );
    assert_eq!(red.len(), 6);

    let stats = store.stats().unwrap();
    assert_eq!(stats.workers, 4);
    store.sync_all().unwrap();
    store.close_all().unwrap();
    assert_eq!(store.stats().map(|s| s.workers).unwrap_or(0), 0);
}

#[test]
fn shared_store_cannot_join_a_per_worker_environment() {
    let (dir, store) = open_store_with(StoreConfig::default().deployment(Deployment::PerWorker));
    commit_all(&store, &[Counter { id: 1, value: 7 }]);

    let err = Store::open(dir.path(), StoreConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let sibling = Store::open(dir.path(), StoreConfig::default().deployment(Deployment::PerWorker)).unwrap();
    let read = thread::spawn(move || sibling.get::<Counter>(1i32).unwrap())
        .join()
        .unwrap();
    assert_eq!(read, Some(Counter { id: 1, value: 7 }));
    store.close_all().unwrap();
}

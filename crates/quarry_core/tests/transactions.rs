mod common;

use common::{commit_all, open_store, open_store_with, Counter};
use parking_lot::Mutex;
use quarry_core::{
    CommitScheduler, CommitStatus, DeadlockPolicy, ErrorKind, PendingTransaction, StoreConfig,
};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn crossing_updates_stay_atomic_under_deadlock_retry() {
    let (_dir, store) = open_store_with(StoreConfig::default().deadlock_policy(DeadlockPolicy::MinWrite));
    commit_all(&store, &[Counter { id: 1, value: 0 }, Counter { id: 2, value: 0 }]);

    let threads = 4;
    let rounds = 10;
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut outcomes = Vec::new();
                for round in 0..rounds {
                    let value = (t * 100 + round) as u64;
                    let (first, second) = if t % 2 == 0 { (1, 2) } else { (2, 1) };
                    let mut txn = store.begin();
                    txn.update(&Counter { id: first, value }).unwrap();
                    txn.update(&Counter { id: second, value }).unwrap();
                    outcomes.push(txn.commit().unwrap());
                }
                outcomes
            })
        })
        .collect();

    let mut committed = 0;
    for worker in workers {
        for outcome in worker.join().unwrap() {
            match outcome {
                CommitStatus::Committed => committed += 1,
                CommitStatus::Aborted(e) => assert_eq!(e.kind(), ErrorKind::Contention),
            }
        }
    }
    assert!(committed > 0);

    let a = store.get::<Counter>(1i32).unwrap().unwrap();
    let b = store.get::<Counter>(2i32).unwrap().unwrap();
    assert_eq!(a.value, b.value, "a transaction was applied partially");
}

#[test]
fn dropped_transaction_commits_inline() {
    let (_dir, store) = open_store();
    {
        let mut txn = store.begin();
        txn.insert(&Counter { id: 5, value: 50 }).unwrap();
    }
    assert_eq!(store.get::<Counter>(5i32).unwrap(), Some(Counter { id: 5, value: 50 }));
}

struct Background(Mutex<Sender<PendingTransaction>>);

impl CommitScheduler for Background {
    fn schedule(&self, txn: PendingTransaction) {
        self.0.lock().send(txn).unwrap();
    }
}

#[test]
fn dropped_transaction_is_committed_by_the_scheduler() {
    let (_dir, store) = open_store();
    let (tx, rx) = mpsc::channel::<PendingTransaction>();
    store.set_scheduler(Some(Arc::new(Background(Mutex::new(tx)))));

    let committer = thread::spawn(move || {
        let mut txn = rx.recv().unwrap();
        txn.commit().unwrap().is_committed()
    });
    {
        let mut txn = store.begin();
        txn.insert(&Counter { id: 6, value: 60 }).unwrap();
    }
    assert!(committer.join().unwrap());
    assert_eq!(store.get::<Counter>(6i32).unwrap(), Some(Counter { id: 6, value: 60 }));
}

#[test]
fn explicit_abort_writes_nothing() {
    let (_dir, store) = open_store();
    {
        let mut txn = store.begin();
        txn.insert(&Counter { id: 7, value: 70 }).unwrap();
        txn.abort();
    }
    assert!(store.get::<Counter>(7i32).unwrap().is_none());
    assert_eq!(store.stats().unwrap().env.commits, 0);
}

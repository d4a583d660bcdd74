mod common;

use common::{collect, commit_all, customer, init_tracing, Customer};
use quarry_core::{CoreError, ErrorKind, Store, StoreConfig};

#[test]
fn stores_over_one_directory_share_the_environment() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let first = Store::open(dir.path(), StoreConfig::default()).unwrap();
    let second = Store::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(first.path(), second.path());

    let alice = customer("alice");
    commit_all(&first, &[alice.clone()]);
    assert_eq!(second.get::<Customer>(alice.id).unwrap(), Some(alice));

    first.close_all().unwrap();
    assert!(second.environment().is_closed());
}

#[test]
fn data_survives_close_and_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let alice = customer("alice");
    {
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        commit_all(&store, &[alice.clone()]);
        store.close_all().unwrap();
    }
    let store = Store::open(dir.path(), StoreConfig::default().create_if_missing(false)).unwrap();
    assert_eq!(collect(store.all::<Customer>().unwrap()), vec![alice.clone()]);
    assert_eq!(
        collect(store.find::<Customer>("email", alice.email.as_str()).unwrap()),
        vec![alice]
    );
    store.close_all().unwrap();
}

#[test]
fn encrypted_store_requires_the_password() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let alice = customer("alice");
    {
        let store = Store::open_encrypted(dir.path(), StoreConfig::default(), "correct horse").unwrap();
        assert!(store.environment().is_encrypted());
        commit_all(&store, &[alice.clone()]);
        store.close_all().unwrap();
    }

    let err = Store::open_encrypted(dir.path(), StoreConfig::default(), "wrong").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let store = Store::open_encrypted(dir.path(), StoreConfig::default(), "correct horse").unwrap();
    assert_eq!(store.get::<Customer>(alice.id).unwrap(), Some(alice));
    store.close_all().unwrap();
}

#[test]
fn stats_report_handles_and_commits() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    commit_all(&store, &[customer("alice"), customer("bob")]);

    let stats = store.stats().unwrap();
    assert_eq!(stats.env.commits, 1);
    assert_eq!(stats.entities, 1);
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.handles.primaries, 1);
    assert_eq!(stats.handles.secondaries, 1);
    store.close_all().unwrap();
}

#[test]
fn running_encrypted_store_rejects_other_passwords() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_encrypted(dir.path(), StoreConfig::default(), "correct horse").unwrap();
    let alice = customer("alice");
    commit_all(&store, &[alice.clone()]);

    let wrong = Store::open_encrypted(dir.path(), StoreConfig::default(), "WRONG").unwrap_err();
    assert_eq!(wrong.kind(), ErrorKind::Configuration);
    let plain = Store::open(dir.path(), StoreConfig::default()).unwrap_err();
    assert_eq!(plain.kind(), ErrorKind::Configuration);

    let second = Store::open_encrypted(dir.path(), StoreConfig::default(), "correct horse").unwrap();
    assert_eq!(second.get::<Customer>(alice.id).unwrap(), Some(alice));
    store.close_all().unwrap();
}

#[test]
fn plain_store_rejects_a_password_while_running() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    let err = Store::open_encrypted(dir.path(), StoreConfig::default(), "secret").unwrap_err();
    assert!(matches!(err, CoreError::Engine(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    store.close_all().unwrap();
}

#[test]
fn sync_all_checkpoints_and_empties_the_log() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let alice = customer("alice");
    {
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        commit_all(&store, &[alice.clone(), customer("bob")]);
        assert!(store.stats().unwrap().env.log_bytes > 0);

        store.sync_all().unwrap();
        assert_eq!(store.stats().unwrap().env.log_bytes, 0);
        assert_eq!(store.get::<Customer>(alice.id).unwrap(), Some(alice.clone()));
        store.close_all().unwrap();
    }
    let store = Store::open(dir.path(), StoreConfig::default().create_if_missing(false)).unwrap();
    assert_eq!(store.all::<Customer>().unwrap().count(), 2);
    store.close_all().unwrap();
}

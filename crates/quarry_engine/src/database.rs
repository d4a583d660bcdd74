//! Database handles.

use crate::config::{DbConfig, Duplicates, ForeignDeleteAction};
use crate::cursor::{Cursor, JoinCursor};
use crate::env::{Association, Environment};
use crate::error::{EngineError, EngineResult};
use crate::tree::{insert_value, DbTree, TreeMap};
use crate::txn::Txn;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info};

/// Derives a secondary key from `(primary_key, primary_value)`.
///
/// `Ok(None)` leaves the record out of the index. An `Err` carries a message
/// and fails the write that triggered it.
pub type KeyExtractor = Arc<dyn Fn(&[u8], &[u8]) -> Result<Option<Vec<u8>>, String> + Send + Sync>;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// An open database.
///
/// Handles are cheap; several may refer to the same database. Unless the
/// environment is free-threaded, a handle may only be used by the thread that
/// opened it.
pub struct Database {
    env: Environment,
    tree: Arc<DbTree>,
    owner: Option<ThreadId>,
    /// Identifies the handle that registered an association or foreign link.
    id: u64,
    closed: AtomicBool,
    open_cursors: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.tree.name())
            .field("duplicates", &self.tree.duplicates())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Opens the database `name`.
    ///
    /// # Errors
    ///
    /// - `NoSuchDatabase` when it does not exist and `config.create` is false
    /// - `EncryptionMismatch` when `config.encrypted` differs from the environment
    /// - `InvalidArgument` when the stored duplicate policy differs
    pub fn open_database(&self, name: &str, config: DbConfig) -> EngineResult<Database> {
        let tree = self.inner.open_tree(name, config)?;
        let owner = (!self.inner.config.free_threaded).then(|| thread::current().id());
        debug!(database = name, "opened database handle");
        Ok(Database {
            env: self.clone(),
            tree,
            owner,
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
            open_cursors: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl Database {
    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.tree.name()
    }

    /// Duplicate policy.
    #[must_use]
    pub fn duplicates(&self) -> Duplicates {
        self.tree.duplicates()
    }

    /// Environment the database lives in.
    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// True once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cursors (including join cursors) opened from this handle and not yet
    /// dropped.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::Acquire)
    }

    fn check(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::HandleClosed {
                name: self.name().to_string(),
            });
        }
        if let Some(owner) = self.owner {
            if owner != thread::current().id() {
                return Err(EngineError::WrongThread {
                    name: self.name().to_string(),
                });
            }
        }
        self.env.inner.ensure_open()
    }

    /// First value stored under `key`.
    ///
    /// With a transaction the read takes a shared lock and sees the
    /// transaction's own writes; without one it reads committed data.
    pub fn get(&self, txn: Option<&mut Txn>, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.get_all(txn, key)?.into_iter().next())
    }

    /// Every value stored under `key`.
    pub fn get_all(&self, txn: Option<&mut Txn>, key: &[u8]) -> EngineResult<Vec<Vec<u8>>> {
        self.check()?;
        match txn {
            Some(txn) => Ok(txn.get(&self.tree, key)?.unwrap_or_default()),
            None => Ok(self.tree.snapshot().get(key).cloned().unwrap_or_default()),
        }
    }

    /// Stores `value` under `key`, replacing it (or adding a duplicate).
    pub fn put(&self, txn: &mut Txn, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.check()?;
        txn.put(&self.tree, key, value, false)
    }

    /// Stores `value` under `key` only if the key is absent.
    ///
    /// # Errors
    ///
    /// `KeyExist` when the key is present.
    pub fn put_no_overwrite(&self, txn: &mut Txn, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.check()?;
        txn.put(&self.tree, key, value, true)
    }

    /// Removes `key` and all its values.
    ///
    /// # Errors
    ///
    /// `NotFound` when the key is absent, `ForeignConflict` when a foreign
    /// secondary still references it.
    pub fn delete(&self, txn: &mut Txn, key: &[u8]) -> EngineResult<()> {
        self.check()?;
        txn.delete(&self.tree, key)
    }

    /// Opens a cursor over the committed data.
    pub fn cursor(&self) -> EngineResult<Cursor> {
        self.check()?;
        Ok(Cursor::new(
            self.name().to_string(),
            self.tree.snapshot(),
            &self.open_cursors,
        ))
    }

    /// Number of keys.
    pub fn len(&self) -> EngineResult<usize> {
        self.check()?;
        Ok(self.tree.snapshot().len())
    }

    /// True when the database holds no keys.
    pub fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Maintains `secondary` from this database through `extractor`.
    ///
    /// When the secondary is empty it is populated from the existing records.
    /// Associating the same pair again replaces the extractor.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when this database allows duplicates, the two handles
    /// belong to different environments, or the secondary already serves
    /// another primary. `KeyExist` when population finds two records for one
    /// unique secondary key.
    pub fn associate(&self, secondary: &Database, extractor: KeyExtractor) -> EngineResult<()> {
        self.check()?;
        secondary.check()?;
        if !Arc::ptr_eq(&self.env.inner, &secondary.env.inner) {
            return Err(EngineError::invalid_argument("databases belong to different environments"));
        }
        if self.duplicates().allows_duplicates() {
            return Err(EngineError::invalid_argument(format!(
                "primary {} must not allow duplicates",
                self.name()
            )));
        }
        if self.name() == secondary.name() {
            return Err(EngineError::invalid_argument("a database cannot index itself"));
        }

        let inner = &self.env.inner;
        if let Some(existing) = inner.relations.read().secondary_of.get(secondary.name()) {
            if existing != self.name() {
                return Err(EngineError::invalid_argument(format!(
                    "{} is already a secondary of {existing}",
                    secondary.name()
                )));
            }
        }

        if secondary.tree.snapshot().is_empty() {
            self.populate(secondary, &extractor)?;
        }

        let mut relations = inner.relations.write();
        let list = relations.associations.entry(self.name().to_string()).or_default();
        list.retain(|a| a.secondary.name() != secondary.name());
        list.push(Association {
            secondary: Arc::clone(&secondary.tree),
            extractor,
        });
        relations
            .secondary_of
            .insert(secondary.name().to_string(), self.name().to_string());
        relations.owners.insert(secondary.name().to_string(), secondary.id);
        info!(primary = self.name(), secondary = secondary.name(), "associated secondary");
        Ok(())
    }

    fn populate(&self, secondary: &Database, extractor: &KeyExtractor) -> EngineResult<()> {
        let primary = self.tree.snapshot();
        if primary.is_empty() {
            return Ok(());
        }
        let mut index = TreeMap::new();
        for (pk, values) in primary.iter() {
            let Some(payload) = values.first() else { continue };
            let sk = extractor(pk, payload).map_err(|message| EngineError::Extractor {
                database: secondary.name().to_string(),
                message,
            })?;
            let Some(sk) = sk else { continue };
            let pks = index.entry(sk).or_default();
            if secondary.duplicates() == Duplicates::None && !pks.is_empty() {
                return Err(EngineError::KeyExist {
                    database: secondary.name().to_string(),
                });
            }
            insert_value(pks, pk.clone(), secondary.duplicates());
        }

        let mut txn = self.env.begin()?;
        txn.stage_index(&secondary.tree, index)?;
        txn.commit()?;
        debug!(secondary = secondary.name(), records = primary.len(), "populated secondary");
        Ok(())
    }

    /// Makes this secondary a foreign key into `parent`.
    ///
    /// Writes to the primary fail with `ForeignConflict` when the derived key
    /// is missing from `parent`; deleting a `parent` key that this secondary
    /// still references fails the same way.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when this handle is not an associated secondary or
    /// `parent` allows duplicates.
    pub fn set_foreign(&self, parent: &Database, action: ForeignDeleteAction) -> EngineResult<()> {
        self.check()?;
        parent.check()?;
        let ForeignDeleteAction::Abort = action;
        if parent.duplicates().allows_duplicates() {
            return Err(EngineError::invalid_argument(format!(
                "foreign database {} must not allow duplicates",
                parent.name()
            )));
        }
        let mut relations = self.env.inner.relations.write();
        if !relations.secondary_of.contains_key(self.name()) {
            return Err(EngineError::invalid_argument(format!(
                "{} must be associated before it can reference {}",
                self.name(),
                parent.name()
            )));
        }
        relations
            .foreign_parent
            .insert(self.name().to_string(), Arc::clone(&parent.tree));
        let children = relations
            .foreign_children
            .entry(parent.name().to_string())
            .or_default();
        children.retain(|c| c.name() != self.name());
        children.push(Arc::clone(&self.tree));
        relations.owners.insert(self.name().to_string(), self.id);
        info!(secondary = self.name(), parent = parent.name(), "attached foreign key");
        Ok(())
    }

    /// Runs a join over secondary cursors positioned on their keys.
    pub fn join(&self, cursors: Vec<Cursor>) -> EngineResult<JoinCursor> {
        self.check()?;
        JoinCursor::new(self.tree.snapshot(), cursors, &self.open_cursors)
    }

    /// Closes the handle. Associations and foreign links registered through
    /// it are dropped, unless another handle re-registered them since.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.env.inner.relations.write().detach(self.name(), self.id);
        debug!(database = self.name(), "closed database handle");
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, OpenFlags};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn env_with(config: EnvConfig) -> (TempDir, Environment) {
        let temp = tempdir().unwrap();
        let env = Environment::open(temp.path(), config, OpenFlags::create(), None).unwrap();
        (temp, env)
    }

    fn env() -> (TempDir, Environment) {
        env_with(EnvConfig::default())
    }

    /// Payloads in these tests are `"<parent>|<color>"`.
    fn field(n: usize) -> KeyExtractor {
        Arc::new(move |_pk: &[u8], payload: &[u8]| -> Result<Option<Vec<u8>>, String> {
            let text = std::str::from_utf8(payload).map_err(|e| e.to_string())?;
            Ok(text
                .split('|')
                .nth(n)
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()))
        })
    }

    fn commit_put(env: &Environment, db: &Database, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let mut txn = env.begin()?;
        db.put(&mut txn, key, value)?;
        txn.commit()
    }

    #[test]
    fn put_get_delete() {
        let (_t, env) = env();
        let db = env.open_database("Customer", DbConfig::create()).unwrap();

        let mut txn = env.begin().unwrap();
        db.put_no_overwrite(&mut txn, b"c1", b"alice").unwrap();
        assert!(matches!(
            db.put_no_overwrite(&mut txn, b"c1", b"bob"),
            Err(EngineError::KeyExist { .. })
        ));
        assert_eq!(db.get(Some(&mut txn), b"c1").unwrap(), Some(b"alice".to_vec()));
        // not visible outside the transaction yet
        assert_eq!(db.get(None, b"c1").unwrap(), None);
        txn.commit().unwrap();
        assert_eq!(db.get(None, b"c1").unwrap(), Some(b"alice".to_vec()));

        let mut txn = env.begin().unwrap();
        db.delete(&mut txn, b"c1").unwrap();
        assert!(matches!(
            db.delete(&mut txn, b"c1"),
            Err(EngineError::NotFound { .. })
        ));
        txn.commit().unwrap();
        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn abort_discards_writes() {
        let (_t, env) = env();
        let db = env.open_database("Customer", DbConfig::create()).unwrap();
        let mut txn = env.begin().unwrap();
        db.put(&mut txn, b"c1", b"alice").unwrap();
        txn.abort();
        assert_eq!(db.len().unwrap(), 0);

        let mut txn = env.begin().unwrap();
        db.put(&mut txn, b"c2", b"bob").unwrap();
        drop(txn);
        assert_eq!(db.len().unwrap(), 0);
    }

    #[test]
    fn sorted_duplicates() {
        let (_t, env) = env();
        let db = env
            .open_database("tags", DbConfig::create().duplicates(Duplicates::Sorted))
            .unwrap();
        let mut txn = env.begin().unwrap();
        db.put(&mut txn, b"k", b"b").unwrap();
        db.put(&mut txn, b"k", b"a").unwrap();
        txn.commit().unwrap();
        assert_eq!(db.get_all(None, b"k").unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn secondary_follows_primary_writes() {
        let (_t, env) = env();
        let orders = env.open_database("Order", DbConfig::create()).unwrap();
        let by_color = env
            .open_database("Order-->color", DbConfig::create().duplicates(Duplicates::Sorted))
            .unwrap();
        orders.associate(&by_color, field(1)).unwrap();

        commit_put(&env, &orders, b"o1", b"c1|red").unwrap();
        commit_put(&env, &orders, b"o2", b"c1|red").unwrap();
        commit_put(&env, &orders, b"o3", b"c1|").unwrap();
        assert_eq!(by_color.get_all(None, b"red").unwrap(), vec![b"o1".to_vec(), b"o2".to_vec()]);
        assert_eq!(by_color.len().unwrap(), 1);

        commit_put(&env, &orders, b"o2", b"c1|blue").unwrap();
        assert_eq!(by_color.get_all(None, b"red").unwrap(), vec![b"o1".to_vec()]);
        assert_eq!(by_color.get_all(None, b"blue").unwrap(), vec![b"o2".to_vec()]);

        let mut txn = env.begin().unwrap();
        orders.delete(&mut txn, b"o1").unwrap();
        txn.commit().unwrap();
        assert!(by_color.get_all(None, b"red").unwrap().is_empty());

        let mut txn = env.begin().unwrap();
        assert!(matches!(
            by_color.put(&mut txn, b"x", b"o9"),
            Err(EngineError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn unique_secondary_rejects_second_owner() {
        let (_t, env) = env();
        let people = env.open_database("Person", DbConfig::create()).unwrap();
        let by_email = env.open_database("Person-->email", DbConfig::create()).unwrap();
        people.associate(&by_email, field(1)).unwrap();

        commit_put(&env, &people, b"p1", b"x|a@example.com").unwrap();
        // rewriting the same record keeps its own key
        commit_put(&env, &people, b"p1", b"y|a@example.com").unwrap();
        assert!(matches!(
            commit_put(&env, &people, b"p2", b"x|a@example.com"),
            Err(EngineError::KeyExist { database }) if database == "Person-->email"
        ));
        assert_eq!(people.len().unwrap(), 1);
    }

    #[test]
    fn associate_populates_empty_secondary() {
        let (_t, env) = env();
        let orders = env.open_database("Order", DbConfig::create()).unwrap();
        commit_put(&env, &orders, b"o1", b"c1|red").unwrap();
        commit_put(&env, &orders, b"o2", b"c2|red").unwrap();

        let by_color = env
            .open_database("Order-->color", DbConfig::create().duplicates(Duplicates::Unsorted))
            .unwrap();
        orders.associate(&by_color, field(1)).unwrap();
        assert_eq!(by_color.get_all(None, b"red").unwrap().len(), 2);
    }

    #[test]
    fn foreign_key_guards_parent_and_child() {
        let (_t, env) = env();
        let customers = env.open_database("Customer", DbConfig::create()).unwrap();
        let orders = env.open_database("Order", DbConfig::create()).unwrap();
        let by_customer = env
            .open_database("Order-->customer", DbConfig::create().duplicates(Duplicates::Sorted))
            .unwrap();
        orders.associate(&by_customer, field(0)).unwrap();
        by_customer.set_foreign(&customers, ForeignDeleteAction::Abort).unwrap();

        assert!(matches!(
            commit_put(&env, &orders, b"o1", b"c1|red"),
            Err(EngineError::ForeignConflict { .. })
        ));

        commit_put(&env, &customers, b"c1", b"alice").unwrap();
        commit_put(&env, &orders, b"o1", b"c1|red").unwrap();

        let mut txn = env.begin().unwrap();
        assert!(matches!(
            customers.delete(&mut txn, b"c1"),
            Err(EngineError::ForeignConflict { .. })
        ));
        txn.abort();
        assert_eq!(customers.len().unwrap(), 1);
        assert_eq!(orders.len().unwrap(), 1);

        // once the child is gone the parent can go
        let mut txn = env.begin().unwrap();
        orders.delete(&mut txn, b"o1").unwrap();
        customers.delete(&mut txn, b"c1").unwrap();
        txn.commit().unwrap();
        assert!(customers.is_empty().unwrap());
    }

    #[test]
    fn closing_a_secondary_detaches_it() {
        let (_t, env) = env();
        let orders = env.open_database("Order", DbConfig::create()).unwrap();
        let by_color = env
            .open_database("Order-->color", DbConfig::create().duplicates(Duplicates::Sorted))
            .unwrap();
        orders.associate(&by_color, field(1)).unwrap();
        by_color.close();

        commit_put(&env, &orders, b"o1", b"c1|red").unwrap();
        let reopened = env
            .open_database("Order-->color", DbConfig::create().duplicates(Duplicates::Sorted))
            .unwrap();
        assert!(reopened.is_empty().unwrap());
        assert!(matches!(reopened.cursor(), Ok(_)));
        assert!(matches!(by_color.len(), Err(EngineError::HandleClosed { .. })));
    }

    #[test]
    fn stale_handle_close_keeps_newer_links() {
        let (_t, env) = env();
        let orders = env.open_database("Order", DbConfig::create()).unwrap();
        let dup = DbConfig::create().duplicates(Duplicates::Sorted);
        let first = env.open_database("Order-->color", dup).unwrap();
        let second = env.open_database("Order-->color", dup).unwrap();
        orders.associate(&first, field(1)).unwrap();
        orders.associate(&second, field(1)).unwrap();
        first.close();

        commit_put(&env, &orders, b"o1", b"c1|red").unwrap();
        assert_eq!(second.get_all(None, b"red").unwrap(), vec![b"o1".to_vec()]);
    }

    #[test]
    fn join_over_two_indices() {
        let (_t, env) = env();
        let orders = env.open_database("Order", DbConfig::create()).unwrap();
        let dup = DbConfig::create().duplicates(Duplicates::Sorted);
        let by_customer = env.open_database("Order-->customer", dup).unwrap();
        let by_color = env.open_database("Order-->color", dup).unwrap();
        orders.associate(&by_customer, field(0)).unwrap();
        orders.associate(&by_color, field(1)).unwrap();

        commit_put(&env, &orders, b"o1", b"c1|red").unwrap();
        commit_put(&env, &orders, b"o2", b"c1|blue").unwrap();
        commit_put(&env, &orders, b"o3", b"c2|red").unwrap();

        let mut a = by_customer.cursor().unwrap();
        let mut b = by_color.cursor().unwrap();
        assert!(a.set(b"c1").is_some());
        assert!(b.set(b"red").is_some());
        let rows: Vec<_> = orders.join(vec![a, b]).unwrap().collect();
        assert_eq!(rows, vec![(b"o1".to_vec(), b"c1|red".to_vec())]);
        assert_eq!(orders.open_cursors(), 0);
        assert_eq!(by_customer.open_cursors(), 0);
    }

    #[test]
    fn cursor_reads_a_snapshot() {
        let (_t, env) = env();
        let db = env.open_database("Customer", DbConfig::create()).unwrap();
        commit_put(&env, &db, b"a", b"1").unwrap();
        let cursor = db.cursor().unwrap();
        commit_put(&env, &db, b"b", b"2").unwrap();
        assert_eq!(cursor.dup_count(), 0);
        assert_eq!(cursor.count(), 1);
        assert_eq!(db.cursor().unwrap().count(), 2);
    }

    #[test]
    fn handle_is_bound_to_its_thread_unless_free_threaded() {
        let (_t, env) = env_with(EnvConfig::default().free_threaded(false));
        let db = Arc::new(env.open_database("Customer", DbConfig::create()).unwrap());
        assert!(db.len().is_ok());

        let other = Arc::clone(&db);
        let result = std::thread::spawn(move || other.len().map(|_| ())).join().unwrap();
        assert!(matches!(result, Err(EngineError::WrongThread { .. })));
    }

    #[test]
    fn crossing_writes_deadlock_and_the_survivor_commits() {
        let (_t, env) = env_with(EnvConfig::default().lock_timeout(Some(Duration::from_secs(10))));
        let db = Arc::new(env.open_database("Account", DbConfig::create()).unwrap());

        let mut t1 = env.begin().unwrap();
        let mut t2 = env.begin().unwrap();
        db.put(&mut t1, b"a", b"t1").unwrap();
        db.put(&mut t2, b"b", b"t2").unwrap();

        let handle = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                db.put(&mut t1, b"b", b"t1")?;
                t1.commit()
            })
        };
        let start = std::time::Instant::now();
        while env.inner.locks.waiting() == 0 {
            assert!(start.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }

        let err = db.put(&mut t2, b"a", b"t2").unwrap_err();
        assert!(err.is_contention());
        assert!(matches!(t2.commit(), Err(EngineError::Deadlock { .. })));

        handle.join().unwrap().unwrap();
        assert_eq!(db.get(None, b"a").unwrap(), Some(b"t1".to_vec()));
        assert_eq!(db.get(None, b"b").unwrap(), Some(b"t1".to_vec()));
    }
}

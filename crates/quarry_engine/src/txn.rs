//! Transactions.
//!
//! A [`Txn`] stages post-images of every key it writes and takes record locks
//! as it goes. Nothing is visible to other readers until [`Txn::commit`]
//! appends one log record and installs the staged images. Dropping an active
//! transaction aborts it.

use crate::config::Duplicates;
use crate::env::{Association, EnvInner};
use crate::error::{EngineError, EngineResult};
use crate::lock::{LockMode, Resource};
use crate::log::{LogOp, LogRecord};
use crate::tree::{insert_value, DbTree, TreeMap};
use crate::types::{TxnId, Values};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting operations.
    Active,
    /// Committed; its writes are visible.
    Committed,
    /// Aborted; its writes were discarded.
    Aborted,
}

struct Staged {
    tree: Arc<DbTree>,
    writes: BTreeMap<Vec<u8>, Values>,
}

/// Secondary maintenance computed for one primary write.
struct IndexChange {
    secondary: Arc<DbTree>,
    old: Option<Vec<u8>>,
    new: Option<Vec<u8>>,
}

/// An engine transaction.
pub struct Txn {
    env: Arc<EnvInner>,
    id: TxnId,
    state: TxnState,
    /// Set after a deadlock; the transaction can only abort.
    doomed: bool,
    staged: HashMap<String, Staged>,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("staged_databases", &self.staged.len())
            .finish()
    }
}

impl Txn {
    pub(crate) fn new(env: Arc<EnvInner>) -> Self {
        let id = env.next_txid();
        Self {
            env,
            id,
            state: TxnState::Active,
            doomed: false,
            staged: HashMap::new(),
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    fn ensure_active(&self) -> EngineResult<()> {
        if self.state != TxnState::Active {
            return Err(EngineError::TxnNotActive { txid: self.id.as_u64() });
        }
        if self.doomed {
            return Err(EngineError::Deadlock { txid: self.id.as_u64() });
        }
        self.env.ensure_open()
    }

    fn lock(&mut self, tree: &DbTree, key: &[u8], mode: LockMode) -> EngineResult<()> {
        let resource: Resource = (tree.name().to_string(), key.to_vec());
        let result = self.env.locks.acquire(self.id, &resource, mode);
        if matches!(result, Err(EngineError::Deadlock { .. })) {
            self.doomed = true;
        }
        result
    }

    /// Current values of `key`: staged first, then committed.
    fn current(&self, tree: &DbTree, key: &[u8]) -> Option<Values> {
        if let Some(staged) = self.staged.get(tree.name()) {
            if let Some(values) = staged.writes.get(key) {
                return (!values.is_empty()).then(|| values.clone());
            }
        }
        tree.snapshot().get(key).cloned()
    }

    fn stage(&mut self, tree: &Arc<DbTree>, key: Vec<u8>, values: Values) {
        self.staged
            .entry(tree.name().to_string())
            .or_insert_with(|| Staged {
                tree: Arc::clone(tree),
                writes: BTreeMap::new(),
            })
            .writes
            .insert(key, values);
    }

    pub(crate) fn get(&mut self, tree: &DbTree, key: &[u8]) -> EngineResult<Option<Values>> {
        self.ensure_active()?;
        self.lock(tree, key, LockMode::Shared)?;
        Ok(self.current(tree, key))
    }

    pub(crate) fn put(
        &mut self,
        tree: &Arc<DbTree>,
        key: &[u8],
        value: &[u8],
        no_overwrite: bool,
    ) -> EngineResult<()> {
        self.ensure_active()?;
        self.reject_secondary_write(tree)?;
        self.lock(tree, key, LockMode::Exclusive)?;

        let current = self.current(tree, key);
        if no_overwrite && current.is_some() {
            return Err(EngineError::KeyExist {
                database: tree.name().to_string(),
            });
        }

        let (associations, parents) = self.links(tree.name());
        let old_payload = current.as_ref().and_then(|v| v.first().cloned());
        let mut changes = Vec::with_capacity(associations.len());
        for association in &associations {
            let secondary = &association.secondary;
            let old = match &old_payload {
                Some(payload) => extract(association, key, payload)?,
                None => None,
            };
            let new = extract(association, key, value)?;

            if let Some(sk) = &new {
                if old.as_ref() != Some(sk) && secondary.duplicates() == Duplicates::None {
                    self.lock(secondary, sk, LockMode::Exclusive)?;
                    let taken = self
                        .current(secondary, sk)
                        .is_some_and(|pks| pks.iter().any(|pk| pk.as_slice() != key));
                    if taken {
                        return Err(EngineError::KeyExist {
                            database: secondary.name().to_string(),
                        });
                    }
                }
                if let Some(parent) = parents.get(secondary.name()) {
                    self.lock(parent, sk, LockMode::Shared)?;
                    if self.current(parent, sk).is_none() {
                        return Err(EngineError::foreign_conflict(format!(
                            "{} references a key missing from {}",
                            secondary.name(),
                            parent.name()
                        )));
                    }
                }
            }
            changes.push(IndexChange {
                secondary: Arc::clone(secondary),
                old,
                new,
            });
        }

        let mut values = current.unwrap_or_default();
        insert_value(&mut values, value.to_vec(), tree.duplicates());
        self.stage(tree, key.to_vec(), values);
        self.apply_index_changes(key, changes)
    }

    pub(crate) fn delete(&mut self, tree: &Arc<DbTree>, key: &[u8]) -> EngineResult<()> {
        self.ensure_active()?;
        self.reject_secondary_write(tree)?;
        self.lock(tree, key, LockMode::Exclusive)?;

        let Some(current) = self.current(tree, key) else {
            return Err(EngineError::NotFound {
                database: tree.name().to_string(),
            });
        };

        let children = self
            .env
            .relations
            .read()
            .foreign_children
            .get(tree.name())
            .cloned()
            .unwrap_or_default();
        for child in &children {
            self.lock(child, key, LockMode::Shared)?;
            if self.current(child, key).is_some() {
                return Err(EngineError::foreign_conflict(format!(
                    "{} still has entries referencing the deleted key in {}",
                    child.name(),
                    tree.name()
                )));
            }
        }

        let (associations, _) = self.links(tree.name());
        let mut changes = Vec::with_capacity(associations.len());
        for association in &associations {
            let old = match current.first() {
                Some(payload) => extract(association, key, payload)?,
                None => None,
            };
            changes.push(IndexChange {
                secondary: Arc::clone(&association.secondary),
                old,
                new: None,
            });
        }

        self.stage(tree, key.to_vec(), Vec::new());
        self.apply_index_changes(key, changes)
    }

    /// Stages precomputed secondary entries, used when populating an index.
    pub(crate) fn stage_index(&mut self, secondary: &Arc<DbTree>, entries: TreeMap) -> EngineResult<()> {
        self.ensure_active()?;
        for (sk, pks) in entries {
            self.lock(secondary, &sk, LockMode::Exclusive)?;
            self.stage(secondary, sk, pks);
        }
        Ok(())
    }

    fn apply_index_changes(&mut self, primary_key: &[u8], changes: Vec<IndexChange>) -> EngineResult<()> {
        for change in changes {
            if change.old == change.new {
                continue;
            }
            let secondary = change.secondary;
            if let Some(old) = change.old {
                self.lock(&secondary, &old, LockMode::Exclusive)?;
                let mut pks = self.current(&secondary, &old).unwrap_or_default();
                pks.retain(|pk| pk.as_slice() != primary_key);
                self.stage(&secondary, old, pks);
            }
            if let Some(new) = change.new {
                self.lock(&secondary, &new, LockMode::Exclusive)?;
                let mut pks = self.current(&secondary, &new).unwrap_or_default();
                insert_value(&mut pks, primary_key.to_vec(), secondary.duplicates());
                self.stage(&secondary, new, pks);
            }
        }
        Ok(())
    }

    /// Secondaries of `primary` and the foreign parents of those secondaries.
    fn links(&self, primary: &str) -> (Vec<Association>, HashMap<String, Arc<DbTree>>) {
        let relations = self.env.relations.read();
        let associations = relations.associations.get(primary).cloned().unwrap_or_default();
        let parents = associations
            .iter()
            .filter_map(|a| {
                relations
                    .foreign_parent
                    .get(a.secondary.name())
                    .map(|p| (a.secondary.name().to_string(), Arc::clone(p)))
            })
            .collect();
        (associations, parents)
    }

    fn reject_secondary_write(&self, tree: &DbTree) -> EngineResult<()> {
        if self.env.relations.read().secondary_of.contains_key(tree.name()) {
            return Err(EngineError::invalid_argument(format!(
                "{} is a secondary database and is written through its primary",
                tree.name()
            )));
        }
        Ok(())
    }

    /// Makes every staged write durable and visible, then releases locks.
    ///
    /// # Errors
    ///
    /// A doomed transaction (deadlock victim) is aborted and reports
    /// `Deadlock`. A log write failure aborts and is returned.
    pub fn commit(mut self) -> EngineResult<()> {
        if self.state != TxnState::Active {
            return Err(EngineError::TxnNotActive { txid: self.id.as_u64() });
        }
        if self.doomed {
            self.abort_in_place();
            return Err(EngineError::Deadlock { txid: self.id.as_u64() });
        }
        if let Err(e) = self.env.ensure_open() {
            self.abort_in_place();
            return Err(e);
        }

        let staged = std::mem::take(&mut self.staged);
        let written = {
            let _gate = self.env.commit_gate.read();
            let ops: Vec<LogOp> = staged
                .values()
                .flat_map(|s| {
                    s.writes.iter().map(|(key, values)| LogOp {
                        db: s.tree.name().to_string(),
                        key: key.clone(),
                        values: values.clone(),
                    })
                })
                .collect();
            let logged = if ops.is_empty() {
                Ok(())
            } else {
                self.env.log.lock().append(&LogRecord::Commit { txid: self.id, ops })
            };
            if logged.is_ok() {
                for s in staged.values() {
                    s.tree.apply(&s.writes);
                }
            }
            logged
        };

        match written {
            Ok(()) => {
                self.state = TxnState::Committed;
                self.env.locks.release_all(self.id);
                self.env.commits.fetch_add(1, Ordering::Relaxed);
                debug!(txid = %self.id, databases = staged.len(), "transaction committed");
                Ok(())
            }
            Err(e) => {
                self.abort_in_place();
                Err(e)
            }
        }
    }

    /// Discards staged writes and releases locks.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        self.staged.clear();
        self.state = TxnState::Aborted;
        self.env.locks.release_all(self.id);
        self.env.aborts.fetch_add(1, Ordering::Relaxed);
        debug!(txid = %self.id, "transaction aborted");
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}

fn extract(association: &Association, key: &[u8], payload: &[u8]) -> EngineResult<Option<Vec<u8>>> {
    (association.extractor)(key, payload).map_err(|message| EngineError::Extractor {
        database: association.secondary.name().to_string(),
        message,
    })
}

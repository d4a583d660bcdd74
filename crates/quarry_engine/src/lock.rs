//! Record locks and deadlock detection.
//!
//! Transactions take shared locks to read and exclusive locks to write, and
//! hold them until commit or abort (strict two-phase locking). A blocked
//! request records `waiter -> holder` edges in a wait-for graph; when a new
//! edge closes a cycle, one transaction in the cycle is chosen as the victim
//! according to the [`DeadlockPolicy`] and fails with `Deadlock`.

use crate::config::DeadlockPolicy;
use crate::error::{EngineError, EngineResult};
use crate::types::TxnId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A lockable record: database name and key.
pub(crate) type Resource = (String, Vec<u8>);

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockEntry {
    shared: HashSet<TxnId>,
    exclusive: Option<TxnId>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

#[derive(Debug, Default)]
struct HeldLocks {
    resources: HashSet<Resource>,
    writes: usize,
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<Resource, LockEntry>,
    held: HashMap<TxnId, HeldLocks>,
    /// Wait-for graph: waiter -> holders it waits on.
    waits_for: HashMap<TxnId, HashSet<TxnId>>,
    /// Transactions chosen as victims that have not yet observed it.
    victims: HashSet<TxnId>,
}

impl LockTable {
    fn blockers(&self, txid: TxnId, resource: &Resource, mode: LockMode) -> HashSet<TxnId> {
        let mut blockers = HashSet::new();
        if let Some(entry) = self.entries.get(resource) {
            if let Some(holder) = entry.exclusive.filter(|h| *h != txid) {
                blockers.insert(holder);
            }
            if mode == LockMode::Exclusive {
                blockers.extend(entry.shared.iter().copied().filter(|h| *h != txid));
            }
        }
        blockers
    }

    fn grant(&mut self, txid: TxnId, resource: Resource, mode: LockMode) {
        let entry = self.entries.entry(resource.clone()).or_default();
        let held = self.held.entry(txid).or_default();
        match mode {
            LockMode::Shared => {
                if entry.exclusive != Some(txid) {
                    entry.shared.insert(txid);
                }
            }
            LockMode::Exclusive => {
                if entry.exclusive != Some(txid) {
                    entry.shared.remove(&txid);
                    entry.exclusive = Some(txid);
                    held.writes += 1;
                }
            }
        }
        held.resources.insert(resource);
    }

    fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        self.dfs(start, start, &mut visited, &mut path)
    }

    fn dfs(
        &self,
        node: TxnId,
        start: TxnId,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        visited.insert(node);
        path.push(node);
        if let Some(holders) = self.waits_for.get(&node) {
            for &holder in holders {
                if holder == start {
                    return Some(path.clone());
                }
                if !visited.contains(&holder) {
                    if let Some(cycle) = self.dfs(holder, start, visited, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        None
    }

    fn write_count(&self, txid: TxnId) -> usize {
        self.held.get(&txid).map_or(0, |h| h.writes)
    }
}

/// Grants record locks and resolves deadlocks.
#[derive(Debug)]
pub(crate) struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    policy: DeadlockPolicy,
    timeout: Option<Duration>,
}

impl LockManager {
    pub(crate) fn new(policy: DeadlockPolicy, timeout: Option<Duration>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            policy,
            timeout,
        }
    }

    /// Blocks until `txid` holds `resource` in `mode`.
    ///
    /// # Errors
    ///
    /// `Deadlock` when `txid` is chosen as a victim, `LockTimeout` when the
    /// configured wait bound elapses.
    pub(crate) fn acquire(&self, txid: TxnId, resource: &Resource, mode: LockMode) -> EngineResult<()> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut table = self.table.lock();
        loop {
            if table.victims.remove(&txid) {
                table.waits_for.remove(&txid);
                return Err(EngineError::Deadlock { txid: txid.as_u64() });
            }

            let blockers = table.blockers(txid, resource, mode);
            if blockers.is_empty() {
                table.waits_for.remove(&txid);
                table.grant(txid, resource.clone(), mode);
                return Ok(());
            }
            table.waits_for.insert(txid, blockers);

            if let Some(cycle) = table.find_cycle(txid) {
                if !cycle.iter().any(|t| table.victims.contains(t)) {
                    let victim = self.choose_victim(&table, &cycle);
                    warn!(
                        victim = %victim,
                        cycle_len = cycle.len(),
                        policy = ?self.policy,
                        "deadlock detected"
                    );
                    if victim == txid {
                        table.waits_for.remove(&txid);
                        return Err(EngineError::Deadlock { txid: txid.as_u64() });
                    }
                    table.victims.insert(victim);
                    self.released.notify_all();
                }
            }

            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut table, deadline).timed_out() {
                        // one last look before giving up
                        if table.blockers(txid, resource, mode).is_empty() && !table.victims.contains(&txid) {
                            continue;
                        }
                        table.waits_for.remove(&txid);
                        debug!(txid = %txid, "lock wait timed out");
                        return Err(EngineError::LockTimeout { txid: txid.as_u64() });
                    }
                }
                None => self.released.wait(&mut table),
            }
        }
    }

    /// Releases every lock held by `txid` and wakes waiters.
    pub(crate) fn release_all(&self, txid: TxnId) {
        let mut table = self.table.lock();
        if let Some(held) = table.held.remove(&txid) {
            for resource in held.resources {
                let now_free = match table.entries.get_mut(&resource) {
                    Some(entry) => {
                        entry.shared.remove(&txid);
                        if entry.exclusive == Some(txid) {
                            entry.exclusive = None;
                        }
                        entry.is_free()
                    }
                    None => false,
                };
                if now_free {
                    table.entries.remove(&resource);
                }
            }
        }
        table.waits_for.remove(&txid);
        for holders in table.waits_for.values_mut() {
            holders.remove(&txid);
        }
        table.victims.remove(&txid);
        drop(table);
        self.released.notify_all();
    }

    fn choose_victim(&self, table: &LockTable, cycle: &[TxnId]) -> TxnId {
        let youngest = cycle.iter().copied().max().unwrap_or(TxnId(0));
        match self.policy {
            DeadlockPolicy::Youngest => youngest,
            DeadlockPolicy::Oldest => cycle.iter().copied().min().unwrap_or(youngest),
            DeadlockPolicy::MinWrite => cycle
                .iter()
                .copied()
                .min_by_key(|t| (table.write_count(*t), std::cmp::Reverse(*t)))
                .unwrap_or(youngest),
        }
    }

    /// Number of transactions currently blocked.
    pub(crate) fn waiting(&self) -> usize {
        self.table.lock().waits_for.len()
    }

    /// Number of locked records.
    pub(crate) fn locked_records(&self) -> usize {
        self.table.lock().entries.len()
    }
}

//! Queued entity transactions with bounded deadlock retry.
//!
//! A [`PendingTransaction`] only records operations. Nothing touches the
//! engine until [`commit`](PendingTransaction::commit): then the entity
//! indices are prepared, one engine transaction is begun, the whole queue is
//! applied in order and the engine commits. When the engine reports lock
//! contention the engine transaction is rolled back and the whole queue is
//! replayed in a fresh one, up to the configured attempt bound.

use crate::catalog::{Entity, EntityDescriptor};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::identity::KeyValue;
use crate::repository::Repository;
use crate::schema::HandleCache;
use crate::store::StoreInner;
use std::fmt;
use std::mem;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[cfg(test)]
type FaultHook = Arc<dyn Fn(u32) -> Option<quarry_engine::EngineError> + Send + Sync>;

/// Kind of queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Store a new record; fails if the identity exists.
    Insert,
    /// Store a record, replacing any previous version.
    Update,
    /// Remove a record.
    Delete,
}

/// One queued operation with its encoded key and payload.
#[derive(Debug, Clone)]
pub struct TransactionElement {
    pub(crate) action: Action,
    pub(crate) descriptor: Arc<EntityDescriptor>,
    pub(crate) key: Vec<u8>,
    pub(crate) payload: Vec<u8>,
}

impl TransactionElement {
    /// Operation kind.
    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Entity name.
    #[must_use]
    pub fn entity(&self) -> &str {
        self.descriptor.name()
    }

    /// Canonical identity bytes.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

/// Lifecycle of a [`PendingTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations.
    Open,
    /// Commit in progress.
    Committing,
    /// Committed.
    Committed,
    /// Rolled back or abandoned.
    Aborted,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransactionState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

/// Outcome of a commit that ran to completion.
///
/// Integrity violations and exhausted contention retries roll the
/// transaction back and are reported here; configuration and resource
/// failures are returned as `Err` instead.
#[derive(Debug)]
pub enum CommitStatus {
    /// Every operation is durable.
    Committed,
    /// Nothing was written.
    Aborted(CoreError),
}

impl CommitStatus {
    /// True for [`CommitStatus::Committed`].
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Takes over transactions that are dropped while still open, so their
/// commit runs somewhere other than the dropping thread.
pub trait CommitScheduler: Send + Sync {
    /// Commits `txn` eventually. Dropping it commits it on the spot.
    fn schedule(&self, txn: PendingTransaction);
}

/// A queue of entity operations committed atomically.
///
/// Dropping an open transaction with queued operations commits it, through
/// the store's [`CommitScheduler`] when one is set.
pub struct PendingTransaction {
    store: Arc<StoreInner>,
    queue: Vec<TransactionElement>,
    state: TransactionState,
    scheduled: bool,
    #[cfg(test)]
    fault: Option<FaultHook>,
}

impl fmt::Debug for PendingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("state", &self.state)
            .field("operations", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl PendingTransaction {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self {
            store,
            queue: Vec::new(),
            state: TransactionState::Open,
            scheduled: false,
            #[cfg(test)]
            fault: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Queued operations.
    #[must_use]
    pub fn elements(&self) -> &[TransactionElement] {
        &self.queue
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.state == TransactionState::Open {
            Ok(())
        } else {
            Err(CoreError::TransactionFinished {
                state: self.state.as_str(),
            })
        }
    }

    fn enqueue<E: Entity>(&mut self, action: Action, entity: &E) -> CoreResult<()> {
        self.ensure_open()?;
        let entry = self.store.catalog().entry::<E>()?;
        let payload = match action {
            Action::Delete => Vec::new(),
            Action::Insert | Action::Update => entity.encode()?,
        };
        self.queue.push(TransactionElement {
            action,
            descriptor: Arc::clone(&entry.descriptor),
            key: entry.key_of(entity),
            payload,
        });
        Ok(())
    }

    /// Queues an insert.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is finished, the entity schema is invalid or
    /// the entity cannot be encoded.
    pub fn insert<E: Entity>(&mut self, entity: &E) -> CoreResult<()> {
        self.enqueue(Action::Insert, entity)
    }

    /// Queues an update.
    ///
    /// # Errors
    ///
    /// Same as [`insert`](Self::insert).
    pub fn update<E: Entity>(&mut self, entity: &E) -> CoreResult<()> {
        self.enqueue(Action::Update, entity)
    }

    /// Queues a delete of `entity`'s identity.
    ///
    /// # Errors
    ///
    /// Same as [`insert`](Self::insert).
    pub fn delete<E: Entity>(&mut self, entity: &E) -> CoreResult<()> {
        self.enqueue(Action::Delete, entity)
    }

    /// Queues a delete by identity.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is finished or the entity schema is invalid.
    pub fn delete_key<E: Entity>(&mut self, key: impl Into<KeyValue>) -> CoreResult<()> {
        self.ensure_open()?;
        let descriptor = self.store.catalog().describe::<E>()?;
        let key = descriptor.identity_bytes(&key.into())?;
        self.queue.push(TransactionElement {
            action: Action::Delete,
            descriptor,
            key,
            payload: Vec::new(),
        });
        Ok(())
    }

    /// Discards the queue. Nothing was written, so nothing is undone.
    pub fn abort(&mut self) {
        if self.state == TransactionState::Open {
            self.queue.clear();
            self.state = TransactionState::Aborted;
            debug!("transaction abandoned");
        }
    }

    /// Applies the queue atomically.
    ///
    /// # Errors
    ///
    /// `TransactionFinished` when called after the transaction ended;
    /// configuration and resource failures from the engine. Integrity
    /// violations and exhausted contention retries are reported through
    /// [`CommitStatus::Aborted`].
    pub fn commit(&mut self) -> CoreResult<CommitStatus> {
        self.ensure_open()?;
        self.state = TransactionState::Committing;
        let result = self.run();
        self.queue.clear();
        self.state = match &result {
            Ok(CommitStatus::Committed) => TransactionState::Committed,
            _ => TransactionState::Aborted,
        };
        result
    }

    fn run(&self) -> CoreResult<CommitStatus> {
        if self.queue.is_empty() {
            return Ok(CommitStatus::Committed);
        }
        let cache = self.store.handles();
        let descriptors = self.descriptors();
        let max = self.store.config().attempts();

        let mut attempt = 1;
        loop {
            match self.attempt(&cache, &descriptors, attempt) {
                Ok(()) => {
                    debug!(attempt, operations = self.queue.len(), "transaction committed");
                    return Ok(CommitStatus::Committed);
                }
                Err(CoreError::Engine(e)) if e.is_contention() => {
                    if attempt >= max {
                        error!(attempts = max, error = %e, "transaction gave up after repeated contention");
                        return Ok(CommitStatus::Aborted(CoreError::RetriesExhausted {
                            attempts: max,
                            last: e,
                        }));
                    }
                    warn!(attempt, max, error = %e, "transaction hit contention, retrying");
                    attempt += 1;
                }
                Err(e) if e.kind() == ErrorKind::Integrity => {
                    info!(error = %e, "transaction rolled back");
                    return Ok(CommitStatus::Aborted(e));
                }
                Err(e) => {
                    error!(error = %e, "transaction failed");
                    return Err(e);
                }
            }
        }
    }

    /// Distinct entities in queue order.
    fn descriptors(&self) -> Vec<Arc<EntityDescriptor>> {
        let mut seen: Vec<Arc<EntityDescriptor>> = Vec::new();
        for element in &self.queue {
            if !seen.iter().any(|d| d.name() == element.descriptor.name()) {
                seen.push(Arc::clone(&element.descriptor));
            }
        }
        seen
    }

    fn attempt(&self, cache: &HandleCache, descriptors: &[Arc<EntityDescriptor>], attempt: u32) -> CoreResult<()> {
        let mut txn = cache.prepare_for_transaction(descriptors)?;
        debug!(txid = %txn.id(), attempt, operations = self.queue.len(), "applying transaction");
        let repository = Repository::new(cache);
        for element in &self.queue {
            repository.apply(&mut txn, element)?;
        }
        #[cfg(test)]
        if let Some(fault) = &self.fault {
            if let Some(e) = fault(attempt) {
                return Err(e.into());
            }
        }
        txn.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_faults(&mut self, hook: FaultHook) {
        self.fault = Some(hook);
    }
}

impl Drop for PendingTransaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Open || self.queue.is_empty() {
            return;
        }
        if !self.scheduled {
            if let Some(scheduler) = self.store.scheduler() {
                let mut handed = PendingTransaction::new(Arc::clone(&self.store));
                handed.queue = mem::take(&mut self.queue);
                handed.scheduled = true;
                self.state = TransactionState::Aborted;
                debug!(operations = handed.queue.len(), "handing dropped transaction to scheduler");
                scheduler.schedule(handed);
                return;
            }
        }
        match self.commit() {
            Ok(CommitStatus::Committed) => debug!("dropped transaction committed"),
            Ok(CommitStatus::Aborted(e)) => warn!(error = %e, "dropped transaction rolled back"),
            Err(e) => error!(error = %e, "dropped transaction failed"),
        }
    }
}

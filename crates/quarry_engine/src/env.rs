//! The shared environment: directory, log, lock manager and open databases.

use crate::config::{DbConfig, EnvConfig, OpenFlags};
use crate::crypto::{derive_key, generate_salt, SALT_SIZE, VERIFIER};
use crate::dir::EnvDir;
use crate::error::{EngineError, EngineResult};
use crate::lock::LockManager;
use crate::log::{self, LogDamage, LogManager, LogRecord};
use crate::tree::DbTree;
use crate::txn::Txn;
use crate::types::TxnId;
use crate::database::KeyExtractor;
use parking_lot::{Mutex, RwLock};
use quarry_storage::{EncryptedBackend, EncryptionKey, FileBackend, StorageBackend, StorageError};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// A secondary database maintained from a primary.
#[derive(Clone)]
pub(crate) struct Association {
    pub secondary: Arc<DbTree>,
    pub extractor: KeyExtractor,
}

/// Runtime links between databases. Not persisted: they are re-established
/// by `associate` and `set_foreign` after every open.
#[derive(Default)]
pub(crate) struct Relations {
    /// primary name -> secondaries maintained from it
    pub associations: HashMap<String, Vec<Association>>,
    /// secondary name -> its primary
    pub secondary_of: HashMap<String, String>,
    /// secondary name -> parent primary it references
    pub foreign_parent: HashMap<String, Arc<DbTree>>,
    /// parent name -> secondaries that reference it
    pub foreign_children: HashMap<String, Vec<Arc<DbTree>>>,
    /// secondary name -> handle that registered its links
    pub owners: HashMap<String, u64>,
}

impl Relations {
    /// Drops the links of `name` if `handle` registered them last.
    pub(crate) fn detach(&mut self, name: &str, handle: u64) {
        if self.owners.get(name) != Some(&handle) {
            return;
        }
        self.owners.remove(name);
        if let Some(primary) = self.secondary_of.remove(name) {
            if let Some(list) = self.associations.get_mut(&primary) {
                list.retain(|a| a.secondary.name() != name);
            }
        }
        if let Some(parent) = self.foreign_parent.remove(name) {
            if let Some(children) = self.foreign_children.get_mut(parent.name()) {
                children.retain(|c| c.name() != name);
            }
        }
    }
}

/// Counters exposed by [`Environment::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvStats {
    /// Databases known to the environment.
    pub databases: usize,
    /// Committed transactions since open.
    pub commits: u64,
    /// Aborted transactions since open.
    pub aborts: u64,
    /// Approximate bytes of committed data held in memory.
    pub resident_bytes: u64,
    /// Durable log size in bytes.
    pub log_bytes: u64,
}

pub(crate) struct EnvInner {
    pub dir: EnvDir,
    pub config: EnvConfig,
    pub key: Option<EncryptionKey>,
    pub trees: RwLock<HashMap<String, Arc<DbTree>>>,
    pub relations: RwLock<Relations>,
    pub locks: LockManager,
    pub log: Mutex<LogManager>,
    /// Commits hold it shared, checkpoints exclusively.
    pub commit_gate: RwLock<()>,
    next_txid: AtomicU64,
    closed: AtomicBool,
    pub commits: AtomicU64,
    pub aborts: AtomicU64,
}

impl EnvInner {
    pub(crate) fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::EnvironmentClosed);
        }
        Ok(())
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn open_tree(&self, name: &str, config: DbConfig) -> EngineResult<Arc<DbTree>> {
        self.ensure_open()?;
        if config.encrypted != self.is_encrypted() {
            return Err(EngineError::encryption_mismatch(format!(
                "database {name} requested encrypted={} in an environment with encrypted={}",
                config.encrypted,
                self.is_encrypted()
            )));
        }

        let existing = self.trees.read().get(name).cloned();
        if let Some(tree) = existing {
            return check_duplicates(tree, config);
        }
        if !config.create {
            return Err(EngineError::NoSuchDatabase { name: name.to_string() });
        }

        let mut trees = self.trees.write();
        if let Some(tree) = trees.get(name) {
            return check_duplicates(Arc::clone(tree), config);
        }
        let backend = open_backend(&self.dir.db_path(name), self.key.as_ref())?;
        let tree = Arc::new(DbTree::new(name.to_string(), config.duplicates, backend));
        {
            let mut log = self.log.lock();
            log.append(&LogRecord::CreateDb {
                name: name.to_string(),
                duplicates: config.duplicates,
            })?;
            log.flush(self.config.sync_on_commit)?;
        }
        tree.persist()?;
        trees.insert(name.to_string(), Arc::clone(&tree));
        info!(database = name, duplicates = ?config.duplicates, "created database");
        Ok(tree)
    }

    pub(crate) fn next_txid(&self) -> TxnId {
        TxnId::new(self.next_txid.fetch_add(1, Ordering::Relaxed))
    }

    fn checkpoint(&self) -> EngineResult<()> {
        let _gate = self.commit_gate.write();
        let mut log = self.log.lock();
        log.flush(true)?;
        let trees: Vec<Arc<DbTree>> = self.trees.read().values().cloned().collect();
        let mut written = 0usize;
        let mut resident = 0u64;
        for tree in &trees {
            if tree.persist()? {
                written += 1;
            }
            resident += tree.resident_bytes();
        }
        log.clear()?;
        if resident > self.config.cache_size {
            warn!(
                resident_bytes = resident,
                cache_size = self.config.cache_size,
                "resident data exceeds the configured cache size"
            );
        }
        debug!(written, databases = trees.len(), "checkpoint complete");
        Ok(())
    }
}

fn check_duplicates(tree: Arc<DbTree>, config: DbConfig) -> EngineResult<Arc<DbTree>> {
    if tree.duplicates() != config.duplicates {
        return Err(EngineError::invalid_argument(format!(
            "database {} exists with duplicates {:?}, requested {:?}",
            tree.name(),
            tree.duplicates(),
            config.duplicates
        )));
    }
    Ok(tree)
}

fn open_backend(path: &Path, key: Option<&EncryptionKey>) -> EngineResult<Box<dyn StorageBackend>> {
    let file = FileBackend::open(path)?;
    Ok(match key {
        Some(key) => Box::new(EncryptedBackend::new(Box::new(file), key)?),
        None => Box::new(file),
    })
}

/// Handle to an open environment. Clones share the same environment.
///
/// ```no_run
/// use quarry_engine::{DbConfig, EnvConfig, Environment, OpenFlags};
///
/// let env = Environment::open("data".as_ref(), EnvConfig::default(), OpenFlags::create(), None)?;
/// let db = env.open_database("Customer", DbConfig::create())?;
/// let mut txn = env.begin()?;
/// db.put(&mut txn, b"c1", b"alice")?;
/// txn.commit()?;
/// env.close()?;
/// # Ok::<(), quarry_engine::EngineError>(())
/// ```
#[derive(Clone)]
pub struct Environment {
    pub(crate) inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.inner.dir.path())
            .field("encrypted", &self.inner.is_encrypted())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Opens the environment in `path`.
    ///
    /// The passphrase, if any, is consumed here and wiped before returning.
    ///
    /// # Errors
    ///
    /// - `RunRecovery` when the previous process did not close cleanly or
    ///   the log is damaged and the flags do not allow the needed recovery
    /// - `InvalidPassword` / `EncryptionMismatch` for passphrase problems
    /// - `EnvironmentLocked` when another process has it open
    pub fn open(
        path: &Path,
        config: EnvConfig,
        flags: OpenFlags,
        password: Option<Zeroizing<String>>,
    ) -> EngineResult<Self> {
        let dir = EnvDir::open(path, flags.create)?;
        let key = load_key(&dir, password)?;
        let recovering = flags.recover || flags.recover_fatal;

        if dir.region_exists() && !recovering {
            return Err(EngineError::run_recovery("environment was not closed cleanly"));
        }

        let mut trees = HashMap::new();
        for file in dir.database_files()? {
            let loaded = open_backend(&file, key.as_ref()).and_then(|backend| {
                if backend.size()? == 0 {
                    return Ok(None);
                }
                DbTree::load(backend).map(Some)
            });
            match loaded {
                Ok(Some(tree)) => {
                    trees.insert(tree.name().to_string(), Arc::new(tree));
                }
                Ok(None) => {
                    debug!(path = %file.display(), "skipping empty database image");
                }
                Err(e) if flags.recover_fatal => {
                    error!(path = %file.display(), error = %e, "dropping unreadable database image");
                    fs::remove_file(&file)?;
                }
                Err(e) => {
                    return Err(EngineError::run_recovery(format!(
                        "database image {} is unreadable: {e}",
                        file.display()
                    )));
                }
            }
        }

        let log_backend = match open_backend(&dir.log_path(), key.as_ref()) {
            Ok(backend) => backend,
            Err(EngineError::Storage(StorageError::Corrupted(reason))) if recovering => {
                warn!(%reason, "discarding unreadable encrypted log");
                let mut raw = FileBackend::open(&dir.log_path())?;
                raw.truncate(0)?;
                open_backend(&dir.log_path(), key.as_ref())?
            }
            Err(EngineError::Storage(StorageError::Corrupted(reason))) => {
                return Err(EngineError::run_recovery(format!("log is unreadable: {reason}")));
            }
            Err(e) => return Err(e),
        };
        let mut log_manager = LogManager::new(log_backend, config.log_buffer_size, config.sync_on_commit);

        let scan = log::scan(&log_manager.read_all()?);
        if let Some(damage) = &scan.damage {
            match damage {
                LogDamage::TornTail { offset } if recovering => {
                    warn!(offset, "truncating torn log tail");
                }
                LogDamage::Corrupt { offset, reason } if flags.recover_fatal => {
                    error!(offset, %reason, "discarding log from damaged record on");
                }
                LogDamage::TornTail { .. } => {
                    return Err(EngineError::run_recovery("log ends in a torn record"));
                }
                LogDamage::Corrupt { offset, reason } => {
                    return Err(EngineError::run_recovery(format!(
                        "log record at offset {offset} is damaged: {reason}"
                    )));
                }
            }
            log_manager.truncate(damage.offset())?;
        }

        let mut max_txid = 0u64;
        let replayed = scan.records.len();
        for record in scan.records {
            match record {
                LogRecord::CreateDb { name, duplicates } => {
                    if !trees.contains_key(&name) {
                        let backend = open_backend(&dir.db_path(&name), key.as_ref())?;
                        trees.insert(name.clone(), Arc::new(DbTree::new(name, duplicates, backend)));
                    }
                }
                LogRecord::Commit { txid, ops } => {
                    max_txid = max_txid.max(txid.as_u64());
                    for op in &ops {
                        match trees.get(&op.db) {
                            Some(tree) => tree.apply([(&op.key, &op.values)]),
                            None if flags.recover_fatal => {
                                warn!(database = %op.db, "skipping log entry for missing database");
                            }
                            None => {
                                return Err(EngineError::run_recovery(format!(
                                    "log references missing database {}",
                                    op.db
                                )));
                            }
                        }
                    }
                }
            }
        }

        let inner = Arc::new(EnvInner {
            dir,
            locks: LockManager::new(config.deadlock_policy, config.lock_timeout),
            config,
            key,
            trees: RwLock::new(trees),
            relations: RwLock::new(Relations::default()),
            log: Mutex::new(log_manager),
            commit_gate: RwLock::new(()),
            next_txid: AtomicU64::new(max_txid + 1),
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        });

        if replayed > 0 || scan.damage.is_some() {
            info!(records = replayed, "recovered environment from log");
            inner.checkpoint()?;
        }
        inner.dir.mark_region()?;
        info!(
            path = %inner.dir.path().display(),
            databases = inner.trees.read().len(),
            encrypted = inner.is_encrypted(),
            "environment opened"
        );
        Ok(Self { inner })
    }

    /// Starts a transaction.
    pub fn begin(&self) -> EngineResult<Txn> {
        self.inner.ensure_open()?;
        Ok(Txn::new(Arc::clone(&self.inner)))
    }

    /// Writes every database image and empties the log.
    pub fn checkpoint(&self) -> EngineResult<()> {
        self.inner.ensure_open()?;
        self.inner.checkpoint()
    }

    /// Flushes the log to durable storage.
    pub fn sync(&self) -> EngineResult<()> {
        self.inner.ensure_open()?;
        self.inner.log.lock().flush(true)
    }

    /// Checkpoints, clears the region marker and releases the directory lock.
    ///
    /// Closing twice is a no-op. Handles still alive afterwards fail with
    /// `EnvironmentClosed`.
    pub fn close(&self) -> EngineResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.checkpoint()?;
        self.inner.closed.store(true, Ordering::Release);
        self.inner.dir.clear_region()?;
        self.inner.dir.unlock();
        info!(path = %self.inner.dir.path().display(), "environment closed");
        Ok(())
    }

    /// True once [`close`](Self::close) has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether databases in this environment are encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.inner.is_encrypted()
    }

    /// Whether handles may be shared across threads.
    #[must_use]
    pub fn is_free_threaded(&self) -> bool {
        self.inner.config.free_threaded
    }

    /// The environment directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.dir.path()
    }

    /// Names of every database in the environment, sorted.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.trees.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Checks that `password` opens this environment: none for a plain
    /// environment, the original passphrase for an encrypted one.
    ///
    /// # Errors
    ///
    /// `EncryptionMismatch` when the presence of a password disagrees with
    /// the environment, `InvalidPassword` when the passphrase is wrong.
    pub fn verify_password(&self, password: Option<Zeroizing<String>>) -> EngineResult<()> {
        self.inner.ensure_open()?;
        match (password, self.inner.key.as_ref()) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(EngineError::encryption_mismatch(
                "environment is encrypted but no password was supplied",
            )),
            (Some(_), None) => Err(EngineError::encryption_mismatch(
                "environment was created without encryption",
            )),
            (Some(password), Some(key)) => {
                let salt = read_salt(&self.inner.dir)?;
                let candidate = derive_key(password, &salt)?;
                if candidate.as_bytes() == key.as_bytes() {
                    Ok(())
                } else {
                    Err(EngineError::InvalidPassword)
                }
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> EngineResult<EnvStats> {
        let trees = self.inner.trees.read();
        Ok(EnvStats {
            databases: trees.len(),
            commits: self.inner.commits.load(Ordering::Relaxed),
            aborts: self.inner.aborts.load(Ordering::Relaxed),
            resident_bytes: trees.values().map(|t| t.resident_bytes()).sum(),
            log_bytes: self.inner.log.lock().size()?,
        })
    }
}

fn load_key(dir: &EnvDir, password: Option<Zeroizing<String>>) -> EngineResult<Option<EncryptionKey>> {
    let salt_path = dir.salt_path();
    match (password, salt_path.exists()) {
        (None, false) => Ok(None),
        (None, true) => Err(EngineError::encryption_mismatch(
            "environment is encrypted but no password was supplied",
        )),
        (Some(password), false) => {
            if !dir.database_files()?.is_empty() || dir.log_path().exists() {
                return Err(EngineError::encryption_mismatch(
                    "environment was created without encryption",
                ));
            }
            let salt = generate_salt();
            fs::write(&salt_path, salt)?;
            let key = derive_key(password, &salt)?;
            let mut verifier = EncryptedBackend::new(Box::new(FileBackend::open(&dir.verifier_path())?), &key)?;
            verifier.replace(VERIFIER)?;
            verifier.sync()?;
            info!("initialized environment encryption");
            Ok(Some(key))
        }
        (Some(password), true) => {
            let salt = read_salt(dir)?;
            let key = derive_key(password, &salt)?;
            let verified = FileBackend::open_existing(&dir.verifier_path())
                .and_then(|file| EncryptedBackend::new(Box::new(file), &key))
                .and_then(|backend| backend.read_all())
                .is_ok_and(|plain| plain == VERIFIER);
            if !verified {
                return Err(EngineError::InvalidPassword);
            }
            Ok(Some(key))
        }
    }
}

fn read_salt(dir: &EnvDir) -> EngineResult<Vec<u8>> {
    let salt = fs::read(dir.salt_path())?;
    if salt.len() != SALT_SIZE {
        return Err(EngineError::corruption("encryption salt", "unexpected length"));
    }
    Ok(salt)
}

//! Process-wide registry of open environments.
//!
//! Opening is idempotent per directory: every store over the same directory
//! shares one [`Environment`]. An open that reports an inconsistent
//! environment is retried with normal recovery, then with catastrophic
//! recovery, before the failure is surfaced.

use crate::config::{Deployment, StoreConfig};
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use quarry_engine::{EngineError, Environment, OpenFlags};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Registry of open environments keyed by canonical directory.
#[derive(Debug, Default)]
pub struct EnvironmentManager {
    open: Mutex<HashMap<PathBuf, Environment>>,
}

impl EnvironmentManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<EnvironmentManager> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Opens the environment in `dir`, or returns the one already open.
    ///
    /// A later open of a directory that is already open must present the
    /// same passphrase (or none, for a plain environment). The password is
    /// wiped when this call returns.
    ///
    /// # Errors
    ///
    /// - `CreateDirectory` when the directory cannot be created
    /// - `Unrecoverable` when even catastrophic recovery fails
    /// - `InvalidPassword` / `EncryptionMismatch` when the password does not
    ///   fit the environment, whether it is opened now or already open
    /// - `Configuration` when a shared deployment asks for an environment
    ///   already opened with thread-bound handles
    /// - engine errors that recovery cannot help with, such as an
    ///   environment locked by another process
    pub fn open(
        &self,
        dir: &Path,
        config: &StoreConfig,
        password: Option<Zeroizing<String>>,
    ) -> CoreResult<Environment> {
        if config.create_if_missing {
            fs::create_dir_all(dir).map_err(|source| CoreError::CreateDirectory {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let path = fs::canonicalize(dir).map_err(EngineError::from)?;

        let mut open = self.open.lock();
        if let Some(env) = open.get(&path) {
            if !env.is_closed() {
                Self::check_reuse(env, config, password)?;
                debug!(path = %path.display(), "reusing open environment");
                return Ok(env.clone());
            }
            open.remove(&path);
        }

        let env = Self::open_with_recovery(&path, config, password)?;
        open.insert(path, env.clone());
        Ok(env)
    }

    fn check_reuse(
        env: &Environment,
        config: &StoreConfig,
        password: Option<Zeroizing<String>>,
    ) -> CoreResult<()> {
        if let Err(e) = env.verify_password(password) {
            warn!(path = %env.path().display(), error = %e, "rejected open of a running environment");
            return Err(e.into());
        }
        if config.deployment == Deployment::Shared && !env.is_free_threaded() {
            return Err(CoreError::configuration(format!(
                "environment {} is open with per-worker handles and cannot serve a shared deployment",
                env.path().display()
            )));
        }
        Ok(())
    }

    fn open_with_recovery(
        path: &Path,
        config: &StoreConfig,
        password: Option<Zeroizing<String>>,
    ) -> CoreResult<Environment> {
        let plain = OpenFlags {
            create: config.create_if_missing,
            ..OpenFlags::default()
        };
        let attempts = [
            ("plain", plain),
            ("recover", plain.with_recover()),
            ("recover-fatal", plain.with_recover_fatal()),
        ];

        let mut last = None;
        for (mode, flags) in attempts {
            match Environment::open(path, config.env_config(), flags, password.clone()) {
                Ok(env) => {
                    info!(path = %path.display(), mode, "environment opened");
                    return Ok(env);
                }
                Err(e @ (EngineError::RunRecovery { .. } | EngineError::Corruption { .. })) => {
                    warn!(path = %path.display(), mode, error = %e, "environment open needs recovery");
                    last = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let last = last.unwrap_or_else(|| EngineError::run_recovery("no open attempt was made"));
        error!(path = %path.display(), error = %last, "environment could not be recovered");
        Err(CoreError::Unrecoverable {
            path: path.to_path_buf(),
            last,
        })
    }

    /// Closes the environment and forgets it. Closing an environment the
    /// registry does not hold only closes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint fails.
    pub fn close(&self, env: &Environment) -> CoreResult<()> {
        self.open.lock().retain(|_, held| held.path() != env.path());
        env.close()?;
        Ok(())
    }

    /// True while an open environment is registered for `dir`.
    #[must_use]
    pub fn is_open(&self, dir: &Path) -> bool {
        let Ok(path) = fs::canonicalize(dir) else {
            return false;
        };
        self.open.lock().get(&path).is_some_and(|env| !env.is_closed())
    }
}

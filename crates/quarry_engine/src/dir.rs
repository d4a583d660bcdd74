//! Environment directory management.
//!
//! ```text
//! <env_path>/
//! ├─ LOCK              # Advisory lock, one process per environment
//! ├─ REGION            # Present while open; stale at open means unclean shutdown
//! ├─ log.dat           # Write-ahead log
//! ├─ ENCRYPTION.salt   # Key derivation salt (encrypted environments)
//! ├─ ENCRYPTION        # Encrypted verifier (encrypted environments)
//! └─ <name>.qdb        # One image per database
//! ```

use crate::error::{EngineError, EngineResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const REGION_FILE: &str = "REGION";
const LOG_FILE: &str = "log.dat";
const SALT_FILE: &str = "ENCRYPTION.salt";
const VERIFIER_FILE: &str = "ENCRYPTION";
const DB_EXTENSION: &str = "qdb";

/// An environment directory held under an exclusive advisory lock.
///
/// The lock is released by [`EnvDir::unlock`] or when the value is dropped.
#[derive(Debug)]
pub(crate) struct EnvDir {
    path: PathBuf,
    lock_file: Mutex<Option<File>>,
}

impl EnvDir {
    /// Opens the directory, creating it when `create` is set.
    ///
    /// # Errors
    ///
    /// Fails if the directory is missing and `create` is false, if the path is
    /// not a directory, or if another process holds the lock.
    pub(crate) fn open(path: &Path, create: bool) -> EngineResult<Self> {
        if !path.exists() {
            if create {
                fs::create_dir_all(path)?;
            } else {
                return Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("environment directory does not exist: {}", path.display()),
                )));
            }
        }
        if !path.is_dir() {
            return Err(EngineError::invalid_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(EngineError::EnvironmentLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            lock_file: Mutex::new(Some(lock_file)),
        })
    }

    /// Releases the advisory lock early, while handles may still reference
    /// the directory.
    pub(crate) fn unlock(&self) {
        if let Some(file) = self.lock_file.lock().take() {
            let _ = FileExt::unlock(&file);
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    pub(crate) fn salt_path(&self) -> PathBuf {
        self.path.join(SALT_FILE)
    }

    pub(crate) fn verifier_path(&self) -> PathBuf {
        self.path.join(VERIFIER_FILE)
    }

    /// Path of the image file for database `name`.
    pub(crate) fn db_path(&self, name: &str) -> PathBuf {
        self.path
            .join(format!("{}.{DB_EXTENSION}", escape_file_name(name)))
    }

    /// True when the previous process did not close the environment.
    pub(crate) fn region_exists(&self) -> bool {
        self.path.join(REGION_FILE).exists()
    }

    pub(crate) fn mark_region(&self) -> EngineResult<()> {
        let file = File::create(self.path.join(REGION_FILE))?;
        file.sync_all()?;
        self.sync_directory()
    }

    pub(crate) fn clear_region(&self) -> EngineResult<()> {
        let region = self.path.join(REGION_FILE);
        if region.exists() {
            fs::remove_file(region)?;
            self.sync_directory()?;
        }
        Ok(())
    }

    /// Lists every database image file in the directory.
    pub(crate) fn database_files(&self) -> EngineResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == DB_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> EngineResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Maps a database name onto a portable file stem.
///
/// Secondary names contain `-->`, which some file systems reject, so every
/// byte outside `[A-Za-z0-9_.-]` is written as `%XX`.
fn escape_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let env_path = temp.path().join("env");

        let dir = EnvDir::open(&env_path, true).unwrap();
        assert!(env_path.is_dir());
        assert_eq!(dir.path(), env_path);
    }

    #[test]
    fn open_without_create_fails() {
        let temp = tempdir().unwrap();
        assert!(EnvDir::open(&temp.path().join("missing"), false).is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = EnvDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            EnvDir::open(temp.path(), true),
            Err(EngineError::EnvironmentLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(EnvDir::open(temp.path(), true).unwrap());
        EnvDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn unlock_allows_reopen_while_alive() {
        let temp = tempdir().unwrap();
        let first = EnvDir::open(temp.path(), true).unwrap();
        first.unlock();
        EnvDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn region_marker_lifecycle() {
        let temp = tempdir().unwrap();
        let dir = EnvDir::open(temp.path(), true).unwrap();
        assert!(!dir.region_exists());
        dir.mark_region().unwrap();
        assert!(dir.region_exists());
        dir.clear_region().unwrap();
        assert!(!dir.region_exists());
    }

    #[test]
    fn secondary_names_are_escaped() {
        let temp = tempdir().unwrap();
        let dir = EnvDir::open(temp.path(), true).unwrap();
        let path = dir.db_path("Order-->customer_id");
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "Order--%3Ecustomer_id.qdb"
        );
        File::create(&path).unwrap();
        File::create(temp.path().join("notes.txt")).unwrap();
        assert_eq!(dir.database_files().unwrap(), vec![path]);
    }
}

//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ resMap<n>         # Structure generations (current and old)
//! └─ resData<n>        # Value generation
//! ```
//!
//! The LOCK file ensures only one process opens the store at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use restree_storage::{FileDirectory, StorageDirectory};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";

/// An opened, exclusively locked database directory.
///
/// The lock is released when the value is dropped.
///
/// ```rust,ignore
/// let dir = DatabaseDir::open(Path::new("store"), true)?;
/// let files = dir.files();
/// ```
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    files: Arc<FileDirectory>,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - `InvalidPath` if the directory is missing and `create_if_missing`
    ///   is false, or the path is not a directory
    /// - `DatabaseLocked` if another process holds the lock
    /// - I/O errors
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_path(
                    path.display().to_string(),
                    "database directory does not exist",
                ));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_path(
                path.display().to_string(),
                "not a directory",
            ));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            files: Arc::new(FileDirectory::open(path)?),
            _lock_file: lock_file,
        })
    }

    /// Path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The generation files, as a storage directory.
    #[must_use]
    pub fn files(&self) -> Arc<dyn StorageDirectory> {
        Arc::clone(&self.files) as Arc<dyn StorageDirectory>
    }

    /// Returns `true` if the directory holds no generation file of either
    /// family.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn is_new_store(&self, structure_prefix: &str, value_prefix: &str) -> CoreResult<bool> {
        Ok(!self
            .files
            .list()?
            .iter()
            .any(|name| name.starts_with(structure_prefix) || name.starts_with(value_prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("new_db");
        let dir = DatabaseDir::open(&db_path, true).unwrap();
        assert!(db_path.is_dir());
        assert!(dir.is_new_store("resMap", "resData").unwrap());
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        let result = DatabaseDir::open(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(CoreError::InvalidPath { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("locked_db");
        let _first = DatabaseDir::open(&db_path, true).unwrap();
        let result = DatabaseDir::open(&db_path, true);
        assert!(matches!(result, Err(CoreError::DatabaseLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("reopen_db");
        {
            let _dir = DatabaseDir::open(&db_path, true).unwrap();
        }
        let _again = DatabaseDir::open(&db_path, true).unwrap();
    }

    #[test]
    fn lock_file_is_not_a_generation() {
        let temp = tempdir().unwrap();
        let dir = DatabaseDir::open(temp.path(), true).unwrap();
        assert!(dir.files().list().unwrap().contains(&"LOCK".to_string()));
        assert!(dir.is_new_store("resMap", "resData").unwrap());

        dir.files().create("resData1").unwrap();
        assert!(!dir.is_new_store("resMap", "resData").unwrap());
    }
}

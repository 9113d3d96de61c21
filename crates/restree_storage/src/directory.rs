//! Flat directories of named byte stores.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A flat namespace of byte stores.
///
/// Generation files are enumerated by name, created fresh, reopened for
/// appends, and removed once retired. Names never contain path separators.
pub trait StorageDirectory: Send + Sync + fmt::Debug {
    /// Lists the names of all files, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list(&self) -> StorageResult<Vec<String>>;

    /// Creates a file, replacing any file with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the file cannot be created.
    fn create(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no such file exists.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Removes a file. Removing a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Makes creations and removals durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be synced.
    fn sync(&self) -> StorageResult<()>;
}

fn check_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(StorageError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A directory on the local file system.
#[derive(Debug, Clone)]
pub struct FileDirectory {
    root: PathBuf,
}

impl FileDirectory {
    /// Uses `root` as the directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl StorageDirectory for FileDirectory {
    fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn create(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        check_name(name)?;
        Ok(Box::new(FileBackend::create(&self.root.join(name))?))
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        check_name(name)?;
        match FileBackend::open(&self.root.join(name)) {
            Ok(backend) => Ok(Box::new(backend)),
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        check_name(name)?;
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn sync(&self) -> StorageResult<()> {
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync(&self) -> StorageResult<()> {
        // NTFS journals metadata; directories cannot be fsynced there
        Ok(())
    }
}

/// An in-memory directory whose files outlive the handles opened on them.
///
/// Cloning the directory shares the files, so a test can keep one clone,
/// drop a database that was using another, and reopen on the same content.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    files: Arc<RwLock<BTreeMap<String, InMemoryBackend>>>,
}

impl MemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared buffer behind `name`, if present.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<InMemoryBackend> {
        self.files.read().get(name).cloned()
    }

    /// Installs a file with the given content, replacing any existing one.
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.files
            .write()
            .insert(name.to_string(), InMemoryBackend::with_data(data));
    }
}

impl StorageDirectory for MemoryDirectory {
    fn list(&self) -> StorageResult<Vec<String>> {
        Ok(self.files.read().keys().cloned().collect())
    }

    fn create(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        check_name(name)?;
        let backend = InMemoryBackend::new();
        self.files.write().insert(name.to_string(), backend.clone());
        Ok(Box::new(backend))
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        check_name(name)?;
        self.file(name)
            .map(|backend| Box::new(backend) as Box<dyn StorageBackend>)
            .ok_or_else(|| StorageError::NotFound {
                name: name.to_string(),
            })
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        check_name(name)?;
        self.files.write().remove(name);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

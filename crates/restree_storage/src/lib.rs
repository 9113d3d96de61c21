//! # restree storage
//!
//! Byte stores and directories of named files for the restree engine.
//!
//! Everything here is format-agnostic: a [`StorageBackend`] is an append-only
//! byte sequence with random-access reads, and a [`StorageDirectory`] is a flat
//! namespace of such sequences. The core crate decides what a generation file
//! looks like; this crate only moves bytes.
//!
//! ## Available Implementations
//!
//! - [`InMemoryBackend`] / [`MemoryDirectory`] - shared buffers, used by tests
//!   and ephemeral stores; clones observe the same bytes, which makes crash
//!   simulation a matter of dropping the writer
//! - [`FileBackend`] / [`FileDirectory`] - OS files below one directory
//!
//! ## Example
//!
//! ```rust
//! use restree_storage::{MemoryDirectory, StorageDirectory};
//!
//! let dir = MemoryDirectory::new();
//! let mut file = dir.create("resData1").unwrap();
//! let offset = file.append(b"hello").unwrap();
//! file.sync().unwrap();
//!
//! let reopened = dir.open("resData1").unwrap();
//! assert_eq!(reopened.read_at(offset, 5).unwrap(), b"hello");
//! assert_eq!(dir.list().unwrap(), vec!["resData1".to_string()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod directory;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use directory::{FileDirectory, MemoryDirectory, StorageDirectory};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;

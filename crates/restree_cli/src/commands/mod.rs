//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod inspect;
pub mod verify;

use restree_core::Config;
use restree_storage::FileDirectory;
use std::path::Path;

/// Opens the generation files of a store without locking it.
pub fn open_files(path: &Path) -> Result<FileDirectory, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    Ok(FileDirectory::open(path)?)
}

/// Config used by commands that open the store.
///
/// Nothing is flushed implicitly, so only `compact` writes.
pub fn tool_config() -> Config {
    Config::default()
        .create_if_missing(false)
        .background_flush(false)
        .flush_on_close(false)
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

//! Error types for restree core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in restree core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] restree_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operation needs a materialized resource.
    #[error("virtual resource: {path}")]
    VirtualResource {
        /// Path of the resource that does not exist.
        path: String,
    },

    /// Read-only access mode or a denied capability check.
    #[error("access denied to {path}: {reason}")]
    AccessDenied {
        /// Path of the resource.
        path: String,
        /// Why access was refused.
        reason: String,
    },

    /// Schema mismatch on a structural add or a typed value access.
    #[error("invalid resource type: {message}")]
    InvalidType {
        /// Description of the mismatch.
        message: String,
    },

    /// A reference that would create an ownership loop or point nowhere.
    #[error("invalid reference: {message}")]
    InvalidReference {
        /// Description of the problem.
        message: String,
    },

    /// API misuse such as executing an action twice or an unbalanced
    /// transaction finish.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Description of the misuse.
        message: String,
    },

    /// No usable generation was found while opening the store.
    #[error("recovery failed: {message}")]
    Recovery {
        /// Description of what was found.
        message: String,
    },

    /// A path or id that does not name a real resource.
    #[error("resource not found: {path}")]
    NotFound {
        /// The path that was looked up.
        path: String,
    },

    /// A toplevel or child name that is already taken.
    #[error("resource already exists: {path}")]
    AlreadyExists {
        /// The occupied path.
        path: String,
    },

    /// A malformed resource path or name.
    #[error("invalid path {path:?}: {message}")]
    InvalidPath {
        /// The rejected path.
        path: String,
        /// Why it was rejected.
        message: String,
    },

    /// A generation file failed to decode.
    #[error("corrupt generation data: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Database is already open or locked by another process.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl CoreError {
    /// Creates a virtual resource error.
    pub fn virtual_resource(path: impl Into<String>) -> Self {
        Self::VirtualResource { path: path.into() }
    }

    /// Creates an access denied error.
    pub fn access_denied(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid type error.
    pub fn invalid_type(message: impl Into<String>) -> Self {
        Self::InvalidType {
            message: message.into(),
        }
    }

    /// Creates an invalid reference error.
    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidReference {
            message: message.into(),
        }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates a recovery error.
    pub fn recovery(message: impl Into<String>) -> Self {
        Self::Recovery {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates an already exists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Returns `true` for errors that mean a generation file is unusable
    /// rather than that the environment failed.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. }
                | Self::ChecksumMismatch { .. }
                | Self::Storage(restree_storage::StorageError::ReadPastEnd { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_build_matching_variants() {
        assert!(matches!(
            CoreError::virtual_resource("meter"),
            CoreError::VirtualResource { ref path } if path == "meter"
        ));
        assert!(matches!(
            CoreError::illegal_state("twice"),
            CoreError::IllegalState { .. }
        ));
    }

    #[test]
    fn display_mentions_context() {
        let err = CoreError::access_denied("room/temp", "read-only");
        assert_eq!(err.to_string(), "access denied to room/temp: read-only");
    }

    #[test]
    fn corruption_classification() {
        assert!(CoreError::corruption("bad footer").is_corruption());
        assert!(CoreError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(!CoreError::DatabaseLocked.is_corruption());
    }
}

//! Error types for content storage.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No object is stored under the key.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The key is not a lowercase hex SHA-256 digest.
    #[error("invalid content key: {0:?}")]
    InvalidKey(String),

    /// The stored bytes no longer hash to their key.
    #[error("object corrupted: {key} hashes to {actual}")]
    Corrupted {
        /// Key the object is stored under.
        key: String,
        /// Hash of the bytes actually read.
        actual: String,
    },
}

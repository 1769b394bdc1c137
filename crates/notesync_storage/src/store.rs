//! Content store trait definition.

use crate::error::{StorageError, StorageResult};
use notesync_protocol::sha256_hex;

/// A content-addressed byte store.
///
/// # Invariants
///
/// - `put` returns `content_key(bytes)` and is idempotent
/// - `get` returns exactly the bytes stored under the key
/// - `delete` of a missing key is not an error
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryContentStore`] - For testing
/// - [`super::FsContentStore`] - For persistent storage
pub trait ContentStore: Send + Sync {
    /// Stores `bytes` and returns their key.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be written.
    fn put(&self, bytes: &[u8]) -> StorageResult<String>;

    /// Reads the object stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no such object exists.
    fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Deletes the object stored under `key`.
    ///
    /// Returns true if an object was removed.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Returns true if an object is stored under `key`.
    fn contains(&self, key: &str) -> StorageResult<bool>;

    /// Lists all stored keys.
    fn keys(&self) -> StorageResult<Vec<String>>;
}

/// Returns the key under which `bytes` are stored.
pub fn content_key(bytes: &[u8]) -> String {
    sha256_hex(bytes)
}

/// Checks that `key` is a lowercase hex SHA-256 digest.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] otherwise.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let valid = key.len() == 64
        && key
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shape() {
        let key = content_key(b"abc");
        assert!(validate_key(&key).is_ok());
        assert_eq!(key, content_key(b"abc"));
        assert_ne!(key, content_key(b"abd"));
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(validate_key("").is_err());
        assert!(validate_key("../../etc/passwd").is_err());
        assert!(validate_key(&"A".repeat(64)).is_err());
        assert!(validate_key(&"a".repeat(63)).is_err());
    }
}

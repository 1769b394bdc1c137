//! In-memory content store for testing.

use crate::error::{StorageError, StorageResult};
use crate::store::{content_key, ContentStore};
use parking_lot::RwLock;
use std::collections::HashMap;

/// An in-memory content store.
///
/// Suitable for unit tests, integration tests and servers that do not need
/// attachments to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryContentStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, bytes: &[u8]) -> StorageResult<String> {
        let key = content_key(bytes);
        self.objects
            .write()
            .entry(key.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(key)
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.write().remove(key).is_some())
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

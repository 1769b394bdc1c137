//! Filesystem content store.

use crate::error::{StorageError, StorageResult};
use crate::store::{content_key, validate_key, ContentStore};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A content store keeping one file per object.
///
/// Objects live at `<root>/<first two hex chars>/<key>`. Writes go to a
/// temporary file in the root and are renamed into place, so a reader never
/// observes a partially written object.
///
/// # Example
///
/// ```no_run
/// use notesync_storage::{ContentStore, FsContentStore};
/// use std::path::Path;
///
/// let store = FsContentStore::open(Path::new("attachments")).unwrap();
/// let key = store.put(b"persistent bytes").unwrap();
/// ```
#[derive(Debug)]
pub struct FsContentStore {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl FsContentStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(&key[..2]).join(key))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!(".tmp-{}-{}-{}", std::process::id(), n, &key[..8]))
    }
}

impl ContentStore for FsContentStore {
    fn put(&self, bytes: &[u8]) -> StorageResult<String> {
        let key = content_key(bytes);
        let path = self.object_path(&key)?;
        if path.exists() {
            return Ok(key);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path(&key);
        let written = (|| -> StorageResult<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &path)?;
            Ok(())
        })();
        if written.is_err() {
            let _ = fs::remove_file(&temp);
        }
        written?;

        tracing::debug!(key = %key, size = bytes.len(), "stored content object");
        Ok(key)
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.object_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = content_key(&bytes);
        if actual != key {
            return Err(StorageError::Corrupted {
                key: key.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(key = %key, "deleted content object");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.object_path(key)?.is_file())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for object in fs::read_dir(shard.path())? {
                let name = object?.file_name().to_string_lossy().into_owned();
                if validate_key(&name).is_ok() {
                    keys.push(name);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let key = {
            let store = FsContentStore::open(dir.path()).unwrap();
            store.put(b"attachment bytes").unwrap()
        };

        let store = FsContentStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&key).unwrap(), b"attachment bytes");
        assert!(dir.path().join(&key[..2]).join(&key).is_file());
    }

    #[test]
    fn identical_bytes_share_one_file() {
        let dir = TempDir::new().unwrap();
        let store = FsContentStore::open(dir.path()).unwrap();

        let a = store.put(b"dup").unwrap();
        let b = store.put(b"dup").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.keys().unwrap(), vec![a]);
    }

    #[test]
    fn detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FsContentStore::open(dir.path()).unwrap();
        let key = store.put(b"original").unwrap();

        fs::write(dir.path().join(&key[..2]).join(&key), b"tampered").unwrap();

        let err = store.get(&key).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FsContentStore::open(dir.path()).unwrap();

        let err = store.get("../secret").unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn delete_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = FsContentStore::open(dir.path()).unwrap();
        let key = store.put(b"x").unwrap();

        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
        assert!(matches!(
            store.get(&key).unwrap_err(),
            StorageError::NotFound(_)
        ));
    }
}

//! # notesync storage
//!
//! Content-addressed byte storage for attachments.
//!
//! Objects are keyed by the lowercase hex SHA-256 of their bytes, so storing
//! the same file twice yields the same key and one physical object. Stores
//! know nothing about attachment rows or reference counts; the server decides
//! when an object is no longer referenced and deletes it.
//!
//! ## Available Stores
//!
//! - [`MemoryContentStore`] - For testing and ephemeral servers
//! - [`FsContentStore`] - One file per object under a root directory
//!
//! ## Example
//!
//! ```rust
//! use notesync_storage::{ContentStore, MemoryContentStore};
//!
//! let store = MemoryContentStore::new();
//! let key = store.put(b"hello world").unwrap();
//! assert_eq!(store.get(&key).unwrap(), b"hello world");
//! assert_eq!(store.put(b"hello world").unwrap(), key);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod fs;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use fs::FsContentStore;
pub use memory::MemoryContentStore;
pub use store::{content_key, validate_key, ContentStore};

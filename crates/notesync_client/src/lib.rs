//! # notesync client
//!
//! Device side of notesync.
//!
//! This crate provides:
//! - A change queue that survives failed pushes and never loses an edit made
//!   while a push is in flight
//! - A sync client that pushes the queue, then pulls remote changes
//! - An HTTP transport and a scripted mock for tests
//! - A listener for the server's notification channel
//! - A background runner that syncs on a poll interval, on notify hints and
//!   on demand
//!
//! ## Architecture
//!
//! Local edits go through [`SyncClient::save`] and [`SyncClient::delete`]:
//! they are stamped with the device clock, written to the [`LocalStore`] and
//! queued. A cycle pushes the queue in batches and then pulls.
//!
//! ## Key Invariants
//!
//! - Only changes the server acknowledged leave the queue
//! - Pulled entities are applied but never re-enqueued
//! - One cycle at a time per client
//! - Entity data only travels over HTTP; the socket carries hints
//!
//! ## Example
//!
//! ```no_run
//! use notesync_client::{HttpTransport, MemoryLocalStore, SyncClient, SyncConfig, SyncRunner};
//! use notesync_protocol::Note;
//! use std::sync::Arc;
//!
//! # async fn run() -> notesync_client::SyncResult<()> {
//! let config = SyncConfig::new("https://sync.example.com", "token", "laptop");
//! let transport = HttpTransport::new(&config)?;
//! let client = Arc::new(SyncClient::new(config, transport, MemoryLocalStore::new()));
//!
//! client.save(Note {
//!     uuid: "0b6e5f9a".into(),
//!     name: "todo.md".into(),
//!     path: "todo.md".into(),
//!     content: "- buy milk".into(),
//!     ..Note::default()
//! })?;
//!
//! let runner = SyncRunner::spawn_with_notifications(client.clone());
//! runner.sync_now().await;
//! # runner.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod http;
mod local;
mod notify;
mod queue;
mod runner;
mod transport;

pub use client::{ClientState, SyncClient, SyncCycleResult, SyncStats};
pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::HttpTransport;
pub use local::{LocalStore, MemoryLocalStore};
pub use notify::{ConnectionStatus, NotifyHint, NotifyListener};
pub use queue::{ChangeQueue, QueuedChange, Settlement};
pub use runner::{RunnerCommand, RunnerHandle, RunnerStatus, SyncRunner};
pub use transport::{MockTransport, SyncTransport};

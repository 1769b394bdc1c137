//! # notesync protocol
//!
//! Wire types shared by the notesync server and its clients.
//!
//! This crate provides:
//! - Entity types (`Note`, `Folder`, `CalendarEvent`, `Attachment`)
//! - `EntityPayload`, a tagged union keyed by entity type
//! - Push, pull and change-feed messages for the HTTP transport
//! - The WebSocket message schema for the notification channel
//! - Content hashing
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Transport split
//!
//! Entity data only ever travels over HTTP. The WebSocket schema in
//! [`ServerMessage`] carries hints (`sync:notify`) and liveness messages; it
//! has no variant able to carry an entity.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod error;
mod hash;
mod messages;
mod notify;
mod operation;

pub use conflict::{Conflict, ConflictReason};
pub use entity::{
    Attachment, CalendarEvent, EntityKey, EntityPayload, EntityType, Folder, Note,
};
pub use error::{ProtocolError, ProtocolResult};
pub use hash::{content_hash, sha256_hex};
pub use messages::{
    ChangesQuery, ChangesResponse, ErrorBody, PullRequest, PullResponse, PushRequest,
    PushResponse, RemoteChange, UploadQuery,
};
pub use notify::{ClientMessage, Heartbeat, ServerMessage, SyncNotify};
pub use operation::{Operation, PushChange};

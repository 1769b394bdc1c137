//! # notesync server
//!
//! Reconciliation server for notesync devices.
//!
//! This crate provides:
//! - HTTP endpoints (push, changes, pull, attachment upload and download)
//! - Entity and sync log persistence (in memory or SQLite)
//! - Bearer token authentication (HS256 JWT)
//! - The `/ws` notification channel
//!
//! # Architecture
//!
//! Devices write through `POST /sync/push`. The [`ReconcileEngine`] applies a
//! batch inside one store transaction: it corrects each change for the
//! device's clock skew, decides per entity whether the incoming state
//! supersedes the stored one, and appends every accepted mutation to the
//! user's sync log. After the commit it asks the [`NotificationHub`] to send
//! a `sync:notify` hint to the user's other devices, which then read the log
//! through `GET /sync/changes`.
//!
//! Entity data never travels over the WebSocket.
//!
//! # Running
//!
//! ```no_run
//! use notesync_server::{ServerConfig, SyncServer};
//!
//! # async fn run() -> notesync_server::ServerResult<()> {
//! let config = ServerConfig::from_env()?;
//! SyncServer::new(config)?.serve().await
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod attachments;
mod auth;
mod clock;
mod config;
mod error;
mod maintenance;
mod notify;
mod reconcile;
mod routes;
mod server;
mod store;
mod ws;

pub use auth::{extract_bearer_token, AuthenticatedDevice, Claims, TokenVerifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use maintenance::VerifyReport;
pub use notify::{ConnectionId, NotificationHub, Registration};
pub use reconcile::{upsert_verdict, EngineLimits, ReconcileEngine, Verdict, SERVER_DEVICE_ID};
pub use routes::{app_router, AppState};
pub use server::SyncServer;
pub use store::{EntityStore, LogPage, MemoryStore, SqliteStore, StoreTxn, SyncLogEntry};
pub use ws::WsParams;

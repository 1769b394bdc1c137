//! # notesync testkit
//!
//! Test utilities for notesync.
//!
//! This crate provides:
//! - Bearer token minting for the test secret
//! - Entity and push change builders
//! - An in-process server bound to a loopback port, driven by a manual clock
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use notesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes_reach_the_server() {
//!     let server = TestServer::start().await;
//!     let token = mint_token("alice", Some("dev-a"));
//!     // ... talk to server.base_url()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;

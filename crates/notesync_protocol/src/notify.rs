//! WebSocket message schema.
//!
//! The notification channel is a hint channel. No message here can carry
//! entity data; devices always fetch changes over HTTP.

use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};

/// Messages sent from the server to a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Changes may be available; the receiver should pull.
    #[serde(rename = "sync:notify")]
    SyncNotify(SyncNotify),
    /// Sent once after the connection is accepted.
    #[serde(rename = "heartbeat")]
    Heartbeat(Heartbeat),
    /// Reply to a client heartbeat.
    #[serde(rename = "pong")]
    Pong(Heartbeat),
}

impl ServerMessage {
    /// Creates a notify hint.
    pub fn notify(timestamp: i64, source_device_id: impl Into<String>) -> Self {
        ServerMessage::SyncNotify(SyncNotify {
            timestamp,
            source_device_id: source_device_id.into(),
        })
    }

    /// Encodes the message as JSON text.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from JSON text.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Payload of `sync:notify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNotify {
    /// Server time of the commit that triggered the hint.
    pub timestamp: i64,
    /// Device whose push triggered the hint.
    pub source_device_id: String,
}

/// Payload of `heartbeat` and `pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Server time.
    pub timestamp: i64,
}

/// Messages sent from a device to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Client-side liveness check; answered with `pong`.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl ClientMessage {
    /// Encodes the message as JSON text.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from JSON text.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

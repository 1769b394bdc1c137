//! Error types for the sync client.

use notesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server did not accept the token.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The token does not cover this device.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The server rejected the request as malformed.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server failed while handling the request.
    #[error("server error ({status}): {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Message from the error body.
        message: String,
    },

    /// The local store failed.
    #[error("local store error: {0}")]
    Local(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    ///
    /// A retry resends the same batch; the queue is never dropped on error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError { .. } => true,
            _ => false,
        }
    }

    /// Maps an HTTP status and error message to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 413 | 422 => SyncError::Rejected(message),
            401 => SyncError::AuthenticationFailed(message),
            403 => SyncError::NotAuthorized(message),
            404 => SyncError::NotFound(message),
            408 => SyncError::Timeout,
            _ => SyncError::ServerError { status, message },
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::from_status(500, "boom").is_retryable());
        assert!(SyncError::from_status(503, "busy").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn client_errors_are_terminal() {
        assert!(matches!(
            SyncError::from_status(401, "expired"),
            SyncError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            SyncError::from_status(403, "wrong device"),
            SyncError::NotAuthorized(_)
        ));
        assert!(matches!(SyncError::from_status(400, "bad"), SyncError::Rejected(_)));
        for status in [400, 401, 403, 404] {
            assert!(!SyncError::from_status(status, "x").is_retryable());
        }
    }

    #[test]
    fn error_display() {
        let err = SyncError::from_status(502, "bad gateway");
        assert_eq!(err.to_string(), "server error (502): bad gateway");
    }
}

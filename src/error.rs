//! Client error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Misuse of a `ResponseHandle` by its owner.
///
/// These never corrupt pool state; they are reported so that callers can
/// find the bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `release()` was called on a handle that was already released.
    DoubleRelease,
    /// The body was read after the handle was released.
    ReadAfterRelease,
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolViolation::DoubleRelease => write!(f, "response released twice"),
            ProtocolViolation::ReadAfterRelease => write!(f, "body read after release"),
        }
    }
}

/// Errors surfaced by the request executor and the release protocol.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport could not establish a connection. Not retried here.
    #[error("Failed to open connection to {destination}: {source}")]
    ConnectOpen {
        /// Destination that was being dialed.
        destination: String,
        /// Underlying transport error.
        source: std::io::Error,
    },

    /// A reused idle connection failed before any response byte arrived.
    #[error("Stale pooled connection: {0}")]
    StaleConnection(#[source] std::io::Error),

    /// The peer sent something that is not a valid HTTP/1.x response head.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The response handle was used against its contract.
    #[error("Caller protocol error: {0}")]
    CallerProtocol(ProtocolViolation),

    /// The request could not be encoded.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An operation did not finish within its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Closing a connection failed.
    #[error("Failed to close connection: {0}")]
    Close(#[source] std::io::Error),

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the error came from the transport rather than the peer's
    /// response or the caller.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectOpen { .. } | Self::StaleConnection(_) | Self::Io(_) | Self::Close(_)
        )
    }
}

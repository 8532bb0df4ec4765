//! Network Error Types
//!
//! Failures surfaced by connections, pools and the request client. Every
//! variant is cheap to clone so a single disconnect can fail many outstanding
//! requests with the same cause.

use muxwire_codec::ProtocolError;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::connection::ConnectionId;

/// Main network error type
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Malformed or oversized frame; the stream cannot be resynchronized
    #[error("Bad protocol: {0}")]
    BadProtocol(#[from] ProtocolError),

    /// Packet could not be written or was rejected by the send queue
    #[error("Send failed (connection {connection_id:?}): {reason}")]
    SendFailed {
        connection_id: Option<ConnectionId>,
        reason: String,
    },

    /// Request waited for a usable connection longer than the send timeout
    #[error("No connection available within {timeout_ms}ms")]
    PendingSendTimeout { timeout_ms: u64 },

    /// Request was sent but no matching reply arrived in time
    #[error("No reply on connection {connection_id} within {timeout_ms}ms")]
    ReceiveTimeout {
        connection_id: ConnectionId,
        timeout_ms: u64,
    },

    /// Connection went away while the operation was outstanding
    #[error("Disconnected (connection {connection_id:?}): {reason}")]
    Disconnected {
        connection_id: Option<ConnectionId>,
        reason: String,
    },

    /// Socket-level I/O errors
    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Outbound connect failed or timed out
    #[error("Connect to {address} failed: {reason}")]
    Connect { address: SocketAddr, reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Connection limits and queue capacity
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },
}

/// Result type alias for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    pub fn send_failed(connection_id: Option<ConnectionId>, reason: impl Into<String>) -> Self {
        Self::SendFailed {
            connection_id,
            reason: reason.into(),
        }
    }

    pub fn disconnected(connection_id: Option<ConnectionId>, reason: impl Into<String>) -> Self {
        Self::Disconnected {
            connection_id,
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error with the operation that produced it
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn connect(address: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Connect {
            address,
            reason: reason.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Whether the same request may succeed on another connection
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::SendFailed { .. } => true,
            NetworkError::Disconnected { .. } => true,
            NetworkError::Io { .. } => true,
            NetworkError::Connect { .. } => true,
            NetworkError::ResourceExhausted { .. } => true,
            NetworkError::BadProtocol(_) => false,
            NetworkError::PendingSendTimeout { .. } => false,
            NetworkError::ReceiveTimeout { .. } => false,
            NetworkError::Configuration { .. } => false,
        }
    }

    /// Get error category for logs and counters
    pub fn category(&self) -> &'static str {
        match self {
            NetworkError::BadProtocol(_) => "bad_protocol",
            NetworkError::SendFailed { .. } => "send_failed",
            NetworkError::PendingSendTimeout { .. } => "pending_send_timeout",
            NetworkError::ReceiveTimeout { .. } => "receive_timeout",
            NetworkError::Disconnected { .. } => "disconnected",
            NetworkError::Io { .. } => "io",
            NetworkError::Connect { .. } => "connect",
            NetworkError::Configuration { .. } => "configuration",
            NetworkError::ResourceExhausted { .. } => "resource_exhausted",
        }
    }
}

//! Protocol-level errors for frame parsing and encoding
//!
//! Every variant is fatal to the connection that produced it: once a stream is
//! out of sync there is no way to find the next frame boundary.

use thiserror::Error;

/// Framing errors with enough context to tell corruption from misconfiguration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared frame length exceeds the configured maximum
    #[error("Frame too large: {size} bytes exceeds maximum {max} ({protocol})")]
    FrameTooLarge {
        size: usize,
        max: usize,
        protocol: &'static str,
    },

    /// Header fields are structurally impossible
    #[error("Corrupt header ({protocol}): {reason} (declared length: {declared_len})")]
    CorruptHeader {
        protocol: &'static str,
        reason: String,
        declared_len: i64,
    },

    /// Command name is missing, too long, or not ASCII
    #[error("Invalid command name: {reason}")]
    InvalidName { reason: String },

    /// Text protocol received bytes that are not UTF-8
    #[error("Invalid UTF-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    /// Line protocol buffered more than the maximum without a terminator
    #[error("Line too long: {len} bytes without CRLF exceeds maximum {max}")]
    LineTooLong { len: usize, max: usize },

    /// Payload cannot be represented in the target protocol
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },
}

impl ProtocolError {
    pub fn frame_too_large(size: usize, max: usize, protocol: &'static str) -> Self {
        Self::FrameTooLarge {
            size,
            max,
            protocol,
        }
    }

    pub fn corrupt_header(
        protocol: &'static str,
        reason: impl Into<String>,
        declared_len: i64,
    ) -> Self {
        Self::CorruptHeader {
            protocol,
            reason: reason.into(),
            declared_len,
        }
    }

    pub fn invalid_name(reason: impl Into<String>) -> Self {
        Self::InvalidName {
            reason: reason.into(),
        }
    }

    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

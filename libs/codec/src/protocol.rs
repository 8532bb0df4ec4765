//! Framing protocol contract
//!
//! A [`FramingProtocol`] is a stateless function over the bytes currently
//! buffered for one connection. It never advances the buffer itself; the
//! caller drops `consumed` bytes after a [`Decoded::Frame`] and keeps
//! everything on [`Decoded::NeedMore`].

use crate::error::ProtocolResult;
use bytes::Bytes;
use std::fmt::Debug;

/// A parsed application message
///
/// Every message carries (or, for synchronous protocols, implies) the sequence
/// id used to match a reply to its request.
pub trait WireMessage: Debug + Send + Sync + 'static {
    /// Correlation id of this message
    fn seq_id(&self) -> u32;

    /// Command name, used by server-side dispatch
    fn name(&self) -> &str;
}

/// Outcome of a single parse attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<M> {
    /// Not enough bytes for one complete message; nothing was consumed
    NeedMore,
    /// One complete message occupying the first `consumed` bytes
    Frame { message: M, consumed: usize },
}

impl<M> Decoded<M> {
    /// Bytes consumed by this outcome (0 for [`Decoded::NeedMore`])
    pub fn consumed(&self) -> usize {
        match self {
            Decoded::NeedMore => 0,
            Decoded::Frame { consumed, .. } => *consumed,
        }
    }

    pub fn into_message(self) -> Option<M> {
        match self {
            Decoded::NeedMore => None,
            Decoded::Frame { message, .. } => Some(message),
        }
    }
}

/// Wire framing shared by client and server sides of a connection
pub trait FramingProtocol: Send + Sync + 'static {
    type Message: WireMessage;

    /// Short protocol name for logs and errors
    fn name(&self) -> &'static str;

    /// Parse at most one message from the front of `buf`
    ///
    /// Returns an error for oversized or structurally invalid frames; the
    /// connection must be closed because the stream is no longer in sync.
    fn parse(&self, buf: &[u8]) -> ProtocolResult<Decoded<Self::Message>>;

    /// Encode an outgoing request
    fn encode_request(&self, seq_id: u32, name: &str, body: &[u8]) -> ProtocolResult<Bytes>;

    /// Encode a reply to `request`, echoing its sequence id
    fn encode_reply(&self, request: &Self::Message, body: &[u8]) -> ProtocolResult<Bytes>;

    /// Largest frame this protocol accepts or produces
    fn max_message_size(&self) -> usize;

    /// The same protocol with its frame limit replaced by `max`
    fn with_max_message_size(self, max: usize) -> Self
    where
        Self: Sized;

    /// `false` for protocols that allow only one request in flight per
    /// connection and therefore cannot carry distinct sequence ids
    fn is_multiplexed(&self) -> bool {
        true
    }
}

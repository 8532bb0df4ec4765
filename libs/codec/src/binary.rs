//! # Length-Prefixed Binary Protocol
//!
//! ## Wire Layout (big-endian)
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────┬───────────────┬──────────────┐
//! │ i32 totalLen │ i32 seqId   │ i16 nameLen  │ name (ASCII)  │ body         │
//! └──────────────┴─────────────┴──────────────┴───────────────┴──────────────┘
//!                 \___________________ totalLen bytes ______________________/
//! ```
//!
//! `totalLen = 6 + len(name) + len(body)`. A `totalLen` below the fixed header
//! size, or a `nameLen` that does not fit inside the frame, means the stream is
//! corrupt.

use crate::constants::{BINARY_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE, LENGTH_PREFIX_SIZE};
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{Decoded, FramingProtocol, WireMessage};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

const PROTOCOL: &str = "binary";

/// One binary frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    pub seq_id: u32,
    pub name: String,
    pub body: Bytes,
}

impl WireMessage for BinaryMessage {
    fn seq_id(&self) -> u32 {
        self.seq_id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Length-prefixed binary framing with multiplexed sequence ids
#[derive(Debug, Clone)]
pub struct BinaryProtocol {
    max_message_size: usize,
}

impl BinaryProtocol {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Encode a frame carrying `seq_id`, `name` and `body`
    pub fn encode(&self, seq_id: u32, name: &str, body: &[u8]) -> ProtocolResult<Bytes> {
        if !name.is_ascii() {
            return Err(ProtocolError::invalid_name(format!(
                "'{}' is not ASCII",
                name
            )));
        }
        if name.len() > i16::MAX as usize {
            return Err(ProtocolError::invalid_name(format!(
                "{} bytes exceeds i16 length field",
                name.len()
            )));
        }

        let total_len = BINARY_HEADER_SIZE + name.len() + body.len();
        let frame_len = LENGTH_PREFIX_SIZE + total_len;
        if frame_len > self.max_message_size || total_len > i32::MAX as usize {
            return Err(ProtocolError::frame_too_large(
                frame_len,
                self.max_message_size,
                PROTOCOL,
            ));
        }

        let mut buf = BytesMut::with_capacity(frame_len);
        buf.put_i32(total_len as i32);
        buf.put_u32(seq_id);
        buf.put_i16(name.len() as i16);
        buf.put_slice(name.as_bytes());
        buf.put_slice(body);
        Ok(buf.freeze())
    }
}

impl Default for BinaryProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FramingProtocol for BinaryProtocol {
    type Message = BinaryMessage;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn parse(&self, buf: &[u8]) -> ProtocolResult<Decoded<BinaryMessage>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(Decoded::NeedMore);
        }

        let total_len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if total_len < BINARY_HEADER_SIZE as i32 {
            trace!(total_len, "rejecting binary frame below header size");
            return Err(ProtocolError::corrupt_header(
                PROTOCOL,
                format!("length below fixed header size {}", BINARY_HEADER_SIZE),
                total_len as i64,
            ));
        }

        let frame_len = LENGTH_PREFIX_SIZE + total_len as usize;
        if frame_len > self.max_message_size {
            return Err(ProtocolError::frame_too_large(
                frame_len,
                self.max_message_size,
                PROTOCOL,
            ));
        }
        if buf.len() < frame_len {
            return Ok(Decoded::NeedMore);
        }

        let seq_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let name_len = i16::from_be_bytes([buf[8], buf[9]]);
        if name_len < 0 || name_len as usize > total_len as usize - BINARY_HEADER_SIZE {
            trace!(name_len, total_len, "rejecting binary frame with bad name length");
            return Err(ProtocolError::corrupt_header(
                PROTOCOL,
                format!("name length {} does not fit the frame", name_len),
                total_len as i64,
            ));
        }

        let name_start = LENGTH_PREFIX_SIZE + BINARY_HEADER_SIZE;
        let name_end = name_start + name_len as usize;
        let name_bytes = &buf[name_start..name_end];
        if !name_bytes.is_ascii() {
            return Err(ProtocolError::invalid_name("command name is not ASCII"));
        }
        // ASCII is always valid UTF-8
        let name = String::from_utf8_lossy(name_bytes).into_owned();
        let body = Bytes::copy_from_slice(&buf[name_end..frame_len]);

        Ok(Decoded::Frame {
            message: BinaryMessage { seq_id, name, body },
            consumed: frame_len,
        })
    }

    fn encode_request(&self, seq_id: u32, name: &str, body: &[u8]) -> ProtocolResult<Bytes> {
        self.encode(seq_id, name, body)
    }

    fn encode_reply(&self, request: &BinaryMessage, body: &[u8]) -> ProtocolResult<Bytes> {
        self.encode(request.seq_id, &request.name, body)
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn with_max_message_size(self, max: usize) -> Self {
        Self::new(max)
    }
}

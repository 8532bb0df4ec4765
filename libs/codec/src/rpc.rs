//! # Length-Prefixed RPC Protocol
//!
//! ## Wire Layout (big-endian)
//!
//! ```text
//! ┌──────────────┬─────────────┬────────────────┬──────────┬───────────┬──────┐
//! │ i32 totalLen │ i32 version │ i32 cmdNameLen │ cmdName  │ i32 seqId │ body │
//! └──────────────┴─────────────┴────────────────┴──────────┴───────────┴──────┘
//! ```
//!
//! The sequence id sits after the variable-length name, so the name length has
//! to be checked against `totalLen` before the id can be located. The check is
//! `totalLen >= cmdNameLen + 12`: the fixed fields without any body, so frames
//! with an empty body are valid.

use crate::constants::{
    DEFAULT_MAX_MESSAGE_SIZE, LENGTH_PREFIX_SIZE, RPC_DEFAULT_VERSION, RPC_FIXED_SIZE,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{Decoded, FramingProtocol, WireMessage};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

const PROTOCOL: &str = "rpc";

/// One RPC frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub version: i32,
    pub name: String,
    pub seq_id: u32,
    pub body: Bytes,
}

impl WireMessage for RpcMessage {
    fn seq_id(&self) -> u32 {
        self.seq_id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// RPC-style framing with the sequence id embedded after the command name
#[derive(Debug, Clone)]
pub struct RpcProtocol {
    version: i32,
    max_message_size: usize,
}

impl RpcProtocol {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            version: RPC_DEFAULT_VERSION,
            max_message_size,
        }
    }

    /// Version stamped on every encoded frame
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn encode(&self, seq_id: u32, name: &str, body: &[u8]) -> ProtocolResult<Bytes> {
        let total_len = RPC_FIXED_SIZE + name.len() + body.len();
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
        buf.put_i32(self.version);
        buf.put_i32(name.len() as i32);
        buf.put_slice(name.as_bytes());
        buf.put_u32(seq_id);
        buf.put_slice(body);
        Ok(buf.freeze())
    }
}

impl Default for RpcProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

impl FramingProtocol for RpcProtocol {
    type Message = RpcMessage;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn parse(&self, buf: &[u8]) -> ProtocolResult<Decoded<RpcMessage>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(Decoded::NeedMore);
        }

        let total_len = read_i32(buf, 0);
        if total_len < RPC_FIXED_SIZE as i32 {
            return Err(ProtocolError::corrupt_header(
                PROTOCOL,
                format!("length below fixed field size {}", RPC_FIXED_SIZE),
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

        let version = read_i32(buf, 4);
        let name_len = read_i32(buf, 8);
        if name_len < 0 || (total_len as i64) < name_len as i64 + RPC_FIXED_SIZE as i64 {
            trace!(name_len, total_len, "rejecting rpc frame with bad name length");
            return Err(ProtocolError::corrupt_header(
                PROTOCOL,
                format!("command name length {} does not fit the frame", name_len),
                total_len as i64,
            ));
        }

        let name_start = LENGTH_PREFIX_SIZE + 8;
        let name_end = name_start + name_len as usize;
        let name = std::str::from_utf8(&buf[name_start..name_end])
            .map_err(|_| ProtocolError::InvalidUtf8 {
                context: "rpc command name",
            })?
            .to_string();
        let seq_id = read_i32(buf, name_end) as u32;
        let body = Bytes::copy_from_slice(&buf[name_end + 4..frame_len]);

        Ok(Decoded::Frame {
            message: RpcMessage {
                version,
                name,
                seq_id,
                body,
            },
            consumed: frame_len,
        })
    }

    fn encode_request(&self, seq_id: u32, name: &str, body: &[u8]) -> ProtocolResult<Bytes> {
        self.encode(seq_id, name, body)
    }

    fn encode_reply(&self, request: &RpcMessage, body: &[u8]) -> ProtocolResult<Bytes> {
        self.encode(request.seq_id, &request.name, body)
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn with_max_message_size(self, max: usize) -> Self {
        Self {
            max_message_size: max,
            ..self
        }
    }
}

//! # Line Protocol (telnet-style)
//!
//! Each message is one UTF-8 line terminated by `CR LF`. The line is split on
//! spaces: the first token is the command, the rest are arguments. An empty
//! line yields an empty command.
//!
//! The protocol has no sequence ids, so it is synchronous: a connection carries
//! one outstanding request at a time and every message implies
//! [`LINE_SEQ_ID`].

use crate::constants::{CRLF, DEFAULT_MAX_MESSAGE_SIZE, LINE_SEQ_ID};
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{Decoded, FramingProtocol, WireMessage};
use bytes::{BufMut, Bytes, BytesMut};

const PROTOCOL: &str = "line";

/// One parsed line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMessage {
    pub command: String,
    pub args: Vec<String>,
    /// Full line without the terminator
    pub line: String,
}

impl LineMessage {
    pub fn from_line(line: impl Into<String>) -> Self {
        let line = line.into();
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let command = tokens.next().unwrap_or_default().to_string();
        let args = tokens.map(str::to_string).collect();
        Self {
            command,
            args,
            line,
        }
    }
}

impl WireMessage for LineMessage {
    fn seq_id(&self) -> u32 {
        LINE_SEQ_ID
    }

    fn name(&self) -> &str {
        &self.command
    }
}

/// CRLF-delimited text framing
#[derive(Debug, Clone)]
pub struct LineProtocol {
    max_line_length: usize,
}

impl LineProtocol {
    pub fn new(max_line_length: usize) -> Self {
        Self { max_line_length }
    }

    /// Encode a single text line, appending the terminator
    pub fn encode_line(&self, text: &str) -> ProtocolResult<Bytes> {
        if text.contains('\r') || text.contains('\n') {
            return Err(ProtocolError::invalid_payload(
                "line protocol payload must not contain CR or LF",
            ));
        }
        let frame_len = text.len() + CRLF.len();
        if frame_len > self.max_line_length {
            return Err(ProtocolError::frame_too_large(
                frame_len,
                self.max_line_length,
                PROTOCOL,
            ));
        }

        let mut buf = BytesMut::with_capacity(frame_len);
        buf.put_slice(text.as_bytes());
        buf.put_slice(CRLF);
        Ok(buf.freeze())
    }
}

impl Default for LineProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|w| w == CRLF)
}

fn body_text(body: &[u8]) -> ProtocolResult<&str> {
    std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8 {
        context: "line protocol payload",
    })
}

impl FramingProtocol for LineProtocol {
    type Message = LineMessage;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn parse(&self, buf: &[u8]) -> ProtocolResult<Decoded<LineMessage>> {
        let Some(end) = find_crlf(buf) else {
            if buf.len() > self.max_line_length {
                return Err(ProtocolError::LineTooLong {
                    len: buf.len(),
                    max: self.max_line_length,
                });
            }
            return Ok(Decoded::NeedMore);
        };

        let consumed = end + CRLF.len();
        if consumed > self.max_line_length {
            return Err(ProtocolError::LineTooLong {
                len: consumed,
                max: self.max_line_length,
            });
        }

        let line = std::str::from_utf8(&buf[..end])
            .map_err(|_| ProtocolError::InvalidUtf8 { context: "line" })?;

        Ok(Decoded::Frame {
            message: LineMessage::from_line(line),
            consumed,
        })
    }

    fn encode_request(&self, _seq_id: u32, name: &str, body: &[u8]) -> ProtocolResult<Bytes> {
        let args = body_text(body)?;
        if args.is_empty() {
            self.encode_line(name)
        } else {
            self.encode_line(&format!("{} {}", name, args))
        }
    }

    fn encode_reply(&self, _request: &LineMessage, body: &[u8]) -> ProtocolResult<Bytes> {
        self.encode_line(body_text(body)?)
    }

    fn max_message_size(&self) -> usize {
        self.max_line_length
    }

    fn with_max_message_size(self, max: usize) -> Self {
        Self::new(max)
    }

    fn is_multiplexed(&self) -> bool {
        false
    }
}

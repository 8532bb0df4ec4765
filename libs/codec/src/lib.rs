//! # muxwire Codec - Wire Framing Layer
//!
//! ## Purpose
//!
//! Turns a raw TCP byte stream into discrete application messages. Every
//! protocol implements the same stateless contract: given the bytes currently
//! available, either report that more bytes are needed or return exactly one
//! parsed message together with the number of bytes it occupied.
//!
//! ## Protocols
//!
//! - [`BinaryProtocol`]: `i32 totalLen | i32 seqId | i16 nameLen | name | body`
//! - [`LineProtocol`]: telnet-style `command arg arg\r\n`, synchronous
//! - [`RpcProtocol`]: `i32 totalLen | i32 version | i32 nameLen | name | i32 seqId | body`
//!
//! ## Architecture Role
//!
//! ```text
//! socket bytes → [codec: FramingProtocol::parse] → WireMessage → network/
//!                        ↑                                          ↓
//!                 carry-over buffer                       request correlation
//!                 (owned by network/)                     or server dispatch
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or reassembly buffers (belongs in network/)
//! - Request/response correlation

pub mod binary;
pub mod constants;
pub mod error;
pub mod line;
pub mod protocol;
pub mod rpc;

pub use binary::{BinaryMessage, BinaryProtocol};
pub use constants::*;
pub use error::{ProtocolError, ProtocolResult};
pub use line::{LineMessage, LineProtocol};
pub use protocol::{Decoded, FramingProtocol, WireMessage};
pub use rpc::{RpcMessage, RpcProtocol};

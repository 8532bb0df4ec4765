//! Wire-level constants shared by the framing protocols.

/// Default upper bound for a single frame, prefix included (16MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the `i32` length prefix used by the length-prefixed protocols
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Binary header after the prefix: `i32 seqId` + `i16 nameLen`
pub const BINARY_HEADER_SIZE: usize = 6;

/// RPC fixed fields after the prefix: `i32 version` + `i32 nameLen` + `i32 seqId`
pub const RPC_FIXED_SIZE: usize = 12;

/// Version written by [`crate::RpcProtocol`] unless configured otherwise
pub const RPC_DEFAULT_VERSION: i32 = 1;

/// Sequence id implied by every line-protocol message
pub const LINE_SEQ_ID: u32 = 0;

/// Line terminator for the telnet-style protocol
pub const CRLF: &[u8; 2] = b"\r\n";

/// Mask keeping generated sequence ids inside the non-negative `i32` range
pub const SEQ_ID_MASK: u32 = 0x7FFF_FFFF;

//! # muxwire Network - Duplex TCP Substrate
//!
//! ## Purpose
//!
//! Full-duplex TCP connections for request/reply systems: ordered
//! non-blocking sends, stream reassembly into framed messages, a named-node
//! connection pool with consistent hashing, and a client that correlates
//! replies with requests under timeouts.
//!
//! ## Architecture Role
//!
//! ```text
//!   Client ── RequestOptions ──► ConnectionPool ── acquire / acquire_by_key
//!     │  pending queue, in-flight map        │
//!     │  (sweeps: send + receive timeouts)   ▼
//!     └────────────────────────────► Host ── Connection ◄──► socket
//!                                     ▲        │ write task: send queue
//!   Server ── CommandTable ───────────┘        │ read task: FrameReader
//!                                              ▼
//!                                   muxwire-codec FramingProtocol
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Wire formats (see `muxwire-codec`)
//! - TLS, authentication, or cross-connection ordering

pub mod client;
pub mod connection;
pub mod error;
pub mod handler;
pub mod host;
pub mod packet;
pub mod pool;
pub mod server;

pub use client::{Client, ClientEvents, ClientStats, InFlightKey, Request, RequestOptions};
pub use connection::{Connection, ConnectionId, ConnectionStatsSnapshot, FrameReader};
pub use error::{NetworkError, Result};
pub use handler::{ConnectionEvents, ConnectionHandler};
pub use host::{Host, ListenerHandle};
pub use packet::{Packet, SendListener};
pub use pool::{ConnectionPool, HashRing, PoolSnapshot};
pub use server::{Command, CommandTable, Dispatch, FnCommand, ReplySink, Server, ServerHandler};

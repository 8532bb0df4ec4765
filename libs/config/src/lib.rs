//! # muxwire Configuration
//!
//! Settings consumed by the network layer, one section per role:
//!
//! - **Listener**: bind address, connection limits, socket and buffer sizes
//! - **Client**: timeouts, sweep intervals, reconnect backoff, server nodes
//!
//! Defaults live in [`defaults`]; [`MuxwireConfig::load`] layers a TOML file,
//! an optional per-environment file and `MUXWIRE__*` environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use muxwire_config::MuxwireConfig;
//!
//! let config = MuxwireConfig::load(None, Some("staging")).unwrap();
//! if let Some(client) = &config.client {
//!     println!("send timeout: {:?}", client.send_timeout());
//! }
//! ```

pub mod defaults;
pub mod settings;

pub use settings::{
    BackoffConfig, ClientConfig, ConnectionConfig, ListenerConfig, MuxwireConfig, NodeConfig,
    load_config,
};

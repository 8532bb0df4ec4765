//! Configuration Loading
//!
//! Loads listener/client settings from TOML files with environment-specific
//! overrides. Every section falls back to [`crate::defaults`] for missing keys.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MuxwireConfig {
    pub listener: Option<ListenerConfig>,
    pub client: Option<ClientConfig>,
}

/// Per-connection socket and buffer settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub socket_buffer_size: usize,
    pub message_buffer_size: usize,
    pub max_message_size: usize,
    pub max_pending_packets: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_buffer_size: defaults::connection::SOCKET_BUFFER_SIZE,
            message_buffer_size: defaults::connection::MESSAGE_BUFFER_SIZE,
            max_message_size: defaults::connection::MAX_MESSAGE_SIZE,
            max_pending_packets: defaults::connection::MAX_PENDING_PACKETS,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.socket_buffer_size == 0 {
            bail!("connection.socket_buffer_size must be greater than zero");
        }
        if self.max_message_size == 0 {
            bail!("connection.max_message_size must be greater than zero");
        }
        if self.max_pending_packets == 0 {
            bail!("connection.max_pending_packets must be greater than zero");
        }
        Ok(())
    }
}

/// Server-side listener settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_address: SocketAddr,
    pub max_connections: usize,
    pub connection: ConnectionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: defaults::listener::BIND_ADDRESS
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8500))),
            max_connections: defaults::listener::MAX_CONNECTIONS,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ListenerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            bail!("listener.max_connections must be greater than zero");
        }
        self.connection.validate()
    }
}

/// A named server node the client keeps one connection to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub name: String,
    pub address: SocketAddr,
}

/// Jittered reconnect windows in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub after_drop_min_ms: u64,
    pub after_drop_max_ms: u64,
    pub after_failure_min_ms: u64,
    pub after_failure_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            after_drop_min_ms: defaults::backoff::AFTER_DROP_MIN_MS,
            after_drop_max_ms: defaults::backoff::AFTER_DROP_MAX_MS,
            after_failure_min_ms: defaults::backoff::AFTER_FAILURE_MIN_MS,
            after_failure_max_ms: defaults::backoff::AFTER_FAILURE_MAX_MS,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.after_drop_min_ms > self.after_drop_max_ms {
            bail!("backoff.after_drop_min_ms must not exceed after_drop_max_ms");
        }
        if self.after_failure_min_ms > self.after_failure_max_ms {
            bail!("backoff.after_failure_min_ms must not exceed after_failure_max_ms");
        }
        Ok(())
    }
}

/// Client-side settings: timeouts, sweeps, reconnects and the node list
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub max_connections: usize,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pending_sweep_interval_ms: u64,
    pub in_flight_sweep_interval_ms: u64,
    pub connection: ConnectionConfig,
    pub backoff: BackoffConfig,
    pub nodes: Vec<NodeConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::client::MAX_CONNECTIONS,
            send_timeout_ms: defaults::client::SEND_TIMEOUT_MS,
            receive_timeout_ms: defaults::client::RECEIVE_TIMEOUT_MS,
            connect_timeout_ms: defaults::client::CONNECT_TIMEOUT_MS,
            pending_sweep_interval_ms: defaults::client::PENDING_SWEEP_INTERVAL_MS,
            in_flight_sweep_interval_ms: defaults::client::IN_FLIGHT_SWEEP_INTERVAL_MS,
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pending_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pending_sweep_interval_ms)
    }

    pub fn in_flight_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.in_flight_sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            bail!("client.max_connections must be greater than zero");
        }
        if self.send_timeout_ms == 0 || self.receive_timeout_ms == 0 {
            bail!("client send/receive timeouts must be greater than zero");
        }
        if self.pending_sweep_interval_ms == 0 || self.in_flight_sweep_interval_ms == 0 {
            bail!("client sweep intervals must be greater than zero");
        }
        let mut names: Vec<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            bail!("client.nodes contains duplicate node name '{}'", pair[0]);
        }
        self.connection.validate()?;
        self.backoff.validate()
    }
}

impl MuxwireConfig {
    /// Load configuration from files with environment overrides
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new("config/muxwire.toml"));

        let mut builder = Config::builder().add_source(File::from(base).required(true));

        if let Some(env) = environment {
            let env_file = PathBuf::from("config/environments").join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        // MUXWIRE__CLIENT__SEND_TIMEOUT_MS=500 overrides client.send_timeout_ms
        builder = builder.add_source(
            Environment::with_prefix("MUXWIRE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: MuxwireConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(listener) = &self.listener {
            listener.validate().context("invalid [listener] section")?;
        }
        if let Some(client) = &self.client {
            client.validate().context("invalid [client] section")?;
        }
        Ok(())
    }
}

/// Convenience function to load configuration from the default location
pub fn load_config(environment: Option<&str>) -> Result<MuxwireConfig> {
    MuxwireConfig::load(None, environment)
}

//! Echo server and client in one process
//!
//! ```text
//! RUST_LOG=debug cargo run -p muxwire-network --example echo
//! ```

use anyhow::{Context, Result};
use bytes::Bytes;
use muxwire_codec::{BinaryMessage, BinaryProtocol};
use muxwire_config::{ClientConfig, ListenerConfig, NodeConfig};
use muxwire_network::{Client, CommandTable, RequestOptions, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut commands = CommandTable::<BinaryProtocol>::new();
    commands
        .register_fn("echo", |m: &BinaryMessage| Some(m.body.clone()))
        .register_fn("upper", |m: &BinaryMessage| {
            Some(Bytes::from(m.body.to_ascii_uppercase()))
        });

    let mut server = Server::new(
        BinaryProtocol::default(),
        commands,
        ListenerConfig {
            bind_address: "127.0.0.1:0".parse()?,
            ..Default::default()
        },
    )?;
    let address = server.start().await.context("starting echo server")?;

    let client = Client::new(
        BinaryProtocol::default(),
        ClientConfig {
            nodes: vec![NodeConfig {
                name: "local".to_string(),
                address,
            }],
            ..Default::default()
        },
    )?;

    let reply = client.call("echo", b"hello muxwire").await?;
    info!(body = %String::from_utf8_lossy(&reply.body), "echo");

    let reply = client
        .call_with("upper", b"routed", RequestOptions::default().with_routing_key("user:42"))
        .await?;
    info!(body = %String::from_utf8_lossy(&reply.body), "upper");

    let stats = client.stats();
    info!(
        live = stats.live_connections,
        in_flight = stats.in_flight_requests,
        "client stats"
    );

    client.shutdown();
    server.stop();
    Ok(())
}

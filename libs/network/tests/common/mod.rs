//! Shared fixtures for the network integration tests
//!
//! Everything runs over real loopback sockets.

#![allow(dead_code)]

use bytes::Bytes;
use muxwire_codec::{
    BinaryMessage, BinaryProtocol, LineMessage, LineProtocol, RpcMessage, RpcProtocol,
};
use muxwire_config::{BackoffConfig, ClientConfig, ListenerConfig, NodeConfig};
use muxwire_network::{
    CommandTable, Connection, ConnectionEvents, ConnectionHandler, NetworkError, Server,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub type BinaryServer = Server<BinaryProtocol, CommandTable<BinaryProtocol>>;
pub type LineServer = Server<LineProtocol, CommandTable<LineProtocol>>;
pub type RpcServer = Server<RpcProtocol, CommandTable<RpcProtocol>>;

/// Route `RUST_LOG` output through the test harness; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn listener_config() -> ListenerConfig {
    ListenerConfig {
        bind_address: loopback(),
        ..Default::default()
    }
}

/// Short timeouts and sweeps so failure paths finish quickly
pub fn client_config(nodes: &[(&str, SocketAddr)]) -> ClientConfig {
    ClientConfig {
        send_timeout_ms: 1_000,
        receive_timeout_ms: 1_000,
        connect_timeout_ms: 500,
        pending_sweep_interval_ms: 20,
        in_flight_sweep_interval_ms: 20,
        backoff: BackoffConfig {
            after_drop_min_ms: 10,
            after_drop_max_ms: 30,
            after_failure_min_ms: 20,
            after_failure_max_ms: 50,
        },
        nodes: nodes
            .iter()
            .map(|(name, address)| NodeConfig {
                name: name.to_string(),
                address: *address,
            })
            .collect(),
        ..Default::default()
    }
}

/// Binary server answering `echo`, `whoami` and never answering `silent`
pub async fn binary_server(name: &'static str) -> (BinaryServer, SocketAddr) {
    init_tracing();
    let mut table = CommandTable::<BinaryProtocol>::new();
    table
        .register_fn("echo", |m: &BinaryMessage| Some(m.body.clone()))
        .register_fn("whoami", move |_: &BinaryMessage| Some(Bytes::from_static(name.as_bytes())))
        .register_fn("silent", |_: &BinaryMessage| None);

    let mut server = Server::new(BinaryProtocol::default(), table, listener_config()).unwrap();
    let address = server.start().await.unwrap();
    (server, address)
}

/// Line server: `echo a b` replies `a b`; `silent` never replies
pub async fn line_server() -> (LineServer, SocketAddr) {
    init_tracing();
    let mut table = CommandTable::<LineProtocol>::new();
    table
        .register_fn("echo", |m: &LineMessage| Some(Bytes::from(m.args.join(" "))))
        .register_fn("silent", |_: &LineMessage| None);

    let mut server = Server::new(LineProtocol::default(), table, listener_config()).unwrap();
    let address = server.start().await.unwrap();
    (server, address)
}

pub async fn rpc_server() -> (RpcServer, SocketAddr) {
    init_tracing();
    let mut table = CommandTable::<RpcProtocol>::new();
    table.register_fn("user.get", |m: &RpcMessage| {
        let mut reply = b"user:".to_vec();
        reply.extend_from_slice(&m.body);
        Some(Bytes::from(reply))
    });

    let mut server = Server::new(RpcProtocol::default(), table, listener_config()).unwrap();
    let address = server.start().await.unwrap();
    (server, address)
}

pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Lifecycle event captured by [`Recorder`]
#[derive(Debug)]
pub enum Event<M> {
    Connected(u64),
    Message(u64, M),
    Disconnected(u64, Option<NetworkError>),
}

/// Handler that forwards every callback into a channel
pub struct Recorder<M> {
    events: mpsc::UnboundedSender<Event<M>>,
}

impl<M: Send + 'static> Recorder<M> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event<M>>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), rx)
    }
}

impl<M: Send + 'static> ConnectionEvents for Recorder<M> {
    fn on_connected(&self, connection: &Arc<Connection>) {
        let _ = self.events.send(Event::Connected(connection.id()));
    }

    fn on_disconnected(&self, connection: &Arc<Connection>, error: Option<&NetworkError>) {
        let _ = self
            .events
            .send(Event::Disconnected(connection.id(), error.cloned()));
    }
}

impl<M: Send + 'static> ConnectionHandler<M> for Recorder<M> {
    fn on_message(&self, connection: &Arc<Connection>, message: M) {
        let _ = self.events.send(Event::Message(connection.id(), message));
    }
}

pub async fn next_event<M>(rx: &mut mpsc::UnboundedReceiver<Event<M>>) -> Event<M> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

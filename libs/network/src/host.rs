//! # Connection Host
//!
//! ## Purpose
//!
//! Owns every live [`Connection`] for one role (a server's accepted sockets or
//! a client's outbound ones). The host assigns connection ids, registers new
//! sockets before they start reading, and removes them when they disconnect.
//!
//! ## Architecture Role
//!
//! ```text
//! accept loop / connect() → Host::register → Connection::open
//!                                  ↓                 ↓
//!                         registry (id → conn)   HostEvents<H> → user handler
//!                                  ↑                 ↓
//!                                  └── on_disconnected removes entry
//! ```

use muxwire_codec::FramingProtocol;
use muxwire_config::ConnectionConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::error::{NetworkError, Result};
use crate::handler::{ConnectionEvents, ConnectionHandler};

const LISTEN_BACKLOG: u32 = 1024;

type Registry = RwLock<HashMap<ConnectionId, Arc<Connection>>>;

/// Registry of live connections sharing one protocol and handler
pub struct Host<P: FramingProtocol, H: ConnectionHandler<P::Message>> {
    protocol: Arc<P>,
    handler: Arc<H>,
    config: ConnectionConfig,
    max_connections: usize,
    next_id: AtomicU64,
    connections: Arc<Registry>,
}

/// Forwards connection events to the user handler and keeps the registry in
/// sync; holds the registry weakly so dropping the host releases it
struct HostEvents<H> {
    handler: Arc<H>,
    registry: Weak<Registry>,
}

impl<H: ConnectionEvents> ConnectionEvents for HostEvents<H> {
    fn on_connected(&self, connection: &Arc<Connection>) {
        self.handler.on_connected(connection);
    }

    fn on_sent(&self, connection: &Arc<Connection>, bytes: usize) {
        self.handler.on_sent(connection, bytes);
    }

    fn on_error(&self, connection: &Arc<Connection>, error: &NetworkError) {
        self.handler.on_error(connection, error);
    }

    fn on_disconnected(&self, connection: &Arc<Connection>, error: Option<&NetworkError>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&connection.id());
        }
        self.handler.on_disconnected(connection, error);
    }
}

impl<M, H: ConnectionHandler<M>> ConnectionHandler<M> for HostEvents<H> {
    fn on_message(&self, connection: &Arc<Connection>, message: M) {
        self.handler.on_message(connection, message);
    }
}

impl<P, H> Host<P, H>
where
    P: FramingProtocol,
    H: ConnectionHandler<P::Message>,
{
    pub fn new(
        protocol: Arc<P>,
        handler: Arc<H>,
        config: ConnectionConfig,
        max_connections: usize,
    ) -> Self {
        Self {
            protocol,
            handler,
            config,
            max_connections,
            next_id: AtomicU64::new(1),
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open an outbound connection and start receiving on it
    pub async fn connect(&self, address: SocketAddr, timeout: Duration) -> Result<Arc<Connection>> {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| NetworkError::io("create socket", e))?;
        self.apply_buffer_sizes(&socket);

        let stream = tokio::time::timeout(timeout, socket.connect(address))
            .await
            .map_err(|_| {
                NetworkError::connect(address, format!("timed out after {}ms", timeout.as_millis()))
            })?
            .map_err(|e| NetworkError::connect(address, e.to_string()))?;

        debug!(%address, "Outbound connection established");
        self.register(stream)
    }

    /// Adopt an established stream: assign an id, register, start reading
    pub fn register(&self, stream: TcpStream) -> Result<Arc<Connection>> {
        let connection = {
            // Limit check and insert under one guard
            let mut registry = self.connections.write();
            if registry.len() >= self.max_connections {
                return Err(NetworkError::resource_exhausted(
                    "connections",
                    format!("limit of {} reached", self.max_connections),
                ));
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let events = Arc::new(HostEvents {
                handler: self.handler.clone(),
                registry: Arc::downgrade(&self.connections),
            });
            let connection =
                Connection::open(id, stream, &self.config, self.protocol.clone(), events)?;
            registry.insert(id, connection.clone());
            connection
        };

        self.handler.on_connected(&connection);
        connection.start_receive();
        Ok(connection)
    }

    /// Bind `address` and accept connections in a background task
    pub async fn listen(self: &Arc<Self>, address: SocketAddr) -> Result<ListenerHandle> {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| NetworkError::io("create listener socket", e))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| NetworkError::io("set SO_REUSEADDR", e))?;
        self.apply_buffer_sizes(&socket);
        socket
            .bind(address)
            .map_err(|e| NetworkError::io(format!("bind {}", address), e))?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| NetworkError::io(format!("listen on {}", address), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::io("read listener address", e))?;

        info!(%local_addr, protocol = self.protocol.name(), "Listening");
        let task = tokio::spawn(accept_loop(Arc::downgrade(self), listener));
        Ok(ListenerHandle { local_addr, task })
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Close every registered connection
    pub fn disconnect_all(&self) {
        for connection in self.connections() {
            connection.disconnect(None);
        }
    }

    fn apply_buffer_sizes(&self, socket: &TcpSocket) {
        let size = self.config.socket_buffer_size.min(u32::MAX as usize) as u32;
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!(size, error = %e, "Failed to set SO_SNDBUF");
        }
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!(size, error = %e, "Failed to set SO_RCVBUF");
        }
    }
}

async fn accept_loop<P, H>(host: Weak<Host<P, H>>, listener: TcpListener)
where
    P: FramingProtocol,
    H: ConnectionHandler<P::Message>,
{
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                // EMFILE and friends clear up once connections close
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let Some(host) = host.upgrade() else {
            debug!("Host dropped, accept loop exiting");
            return;
        };
        match host.register(stream) {
            Ok(connection) => {
                debug!(connection_id = connection.id(), %peer, "Accepted connection");
            }
            Err(e) => {
                warn!(%peer, error = %e, "Rejected inbound connection");
            }
        }
    }
}

/// Running accept loop; stops accepting when dropped
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

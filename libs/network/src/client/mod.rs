//! # Request Client
//!
//! ## Purpose
//!
//! Turns "send this command, give me the reply" into wire traffic over a
//! [`ConnectionPool`], matching replies to requests by sequence id (or, for
//! synchronous protocols, by connection).
//!
//! ## Request Lifecycle
//!
//! ```text
//! call() ──► dispatch ──► no connection ──► pending queue ──(sweep)──┐
//!               │                                 ▲                  │
//!               ▼                                 │ send failed,     ▼
//!        connection.send ──► on_start_sending ────┤ retry allowed   PendingSendTimeout
//!                               │ (in-flight)     │
//!                               ▼                 │
//!                          on_sent (sent_at) ──► reply ──► Ok(message)
//!                               │
//!                               ├─(sweep) no reply in time ──► ReceiveTimeout
//!                               └─ connection lost ──────────► Disconnected
//! ```
//!
//! Every detector claims a request by removing it from its collection first,
//! and [`Request::complete`] refuses a second outcome, so each call resolves
//! exactly once.

pub mod request;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use muxwire_codec::{FramingProtocol, WireMessage, SEQ_ID_MASK};
use muxwire_config::ClientConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::error::{NetworkError, Result};
use crate::handler::{ConnectionEvents, ConnectionHandler};
use crate::host::Host;
use crate::packet::{Packet, SendListener};
use crate::pool::ConnectionPool;
use crate::server::apply_frame_limit;

pub use request::{InFlightKey, Request, RequestOptions};

/// Sequence id carried by every request of a synchronous protocol
const SYNCHRONOUS_SEQ_ID: u32 = 0;

/// Point-in-time client counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub pending_requests: usize,
    pub in_flight_requests: usize,
    pub live_connections: usize,
    pub registered_nodes: usize,
}

type Pending<M> = Arc<Request<M>>;

struct ClientInner<P: FramingProtocol> {
    protocol: Arc<P>,
    multiplexed: bool,
    config: ClientConfig,
    pool: ConnectionPool<P, ClientEvents<P>>,
    next_seq: AtomicU32,
    pending: Mutex<VecDeque<Pending<P::Message>>>,
    in_flight: DashMap<InFlightKey, Pending<P::Message>>,
    closed: AtomicBool,
}

/// Connection handler installed on the client's host
///
/// Holds the client weakly; once the client is dropped, late events from
/// closing connections are ignored.
pub struct ClientEvents<P: FramingProtocol> {
    client: Weak<ClientInner<P>>,
}

impl<P: FramingProtocol> ConnectionEvents for ClientEvents<P> {
    fn on_disconnected(&self, connection: &Arc<Connection>, error: Option<&NetworkError>) {
        if let Some(client) = self.client.upgrade() {
            client.handle_disconnect(connection, error);
        }
    }
}

impl<P: FramingProtocol> ConnectionHandler<P::Message> for ClientEvents<P> {
    fn on_message(&self, connection: &Arc<Connection>, message: P::Message) {
        if let Some(client) = self.client.upgrade() {
            client.handle_reply(connection, message);
        }
    }
}

/// Per-packet listener tying a request to the client's collections
struct RequestSendListener<P: FramingProtocol> {
    request: Pending<P::Message>,
    client: Weak<ClientInner<P>>,
}

impl<P: FramingProtocol> SendListener for RequestSendListener<P> {
    fn on_start_sending(&self, connection: &Arc<Connection>) {
        if let Some(client) = self.client.upgrade() {
            client.handle_start_sending(connection, &self.request);
        }
    }

    fn on_sent(&self, _connection: &Arc<Connection>) {
        self.request.mark_sent();
    }

    fn on_send_failed(&self, connection: &Arc<Connection>, error: &NetworkError) {
        match self.client.upgrade() {
            Some(client) => client.handle_send_failure(connection, &self.request, error),
            None => {
                self.request.fail(NetworkError::send_failed(
                    Some(connection.id()),
                    error.to_string(),
                ));
            }
        }
    }
}

/// Pooled request/reply client
pub struct Client<P: FramingProtocol> {
    inner: Arc<ClientInner<P>>,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: FramingProtocol> Client<P> {
    /// Build the client, register `config.nodes` and start both sweeps
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(protocol: P, config: ClientConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NetworkError::configuration(format!("{:#}", e)))?;

        let multiplexed = protocol.is_multiplexed();
        let protocol = Arc::new(apply_frame_limit(protocol, config.connection.max_message_size));
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner<P>>| {
            let events = Arc::new(ClientEvents {
                client: weak.clone(),
            });
            let host = Host::new(
                protocol.clone(),
                events,
                config.connection.clone(),
                config.max_connections,
            );
            let pool = ConnectionPool::new(
                Arc::new(host),
                config.backoff.clone(),
                config.connect_timeout(),
            );

            ClientInner {
                protocol,
                multiplexed,
                config: config.clone(),
                pool,
                next_seq: AtomicU32::new(1),
                pending: Mutex::new(VecDeque::new()),
                in_flight: DashMap::new(),
                closed: AtomicBool::new(false),
            }
        });

        for node in &config.nodes {
            inner.pool.register(node.name.clone(), node.address);
        }

        let sweeps = vec![
            spawn_sweep(
                Arc::downgrade(&inner),
                config.pending_sweep_interval(),
                ClientInner::sweep_pending,
            ),
            spawn_sweep(
                Arc::downgrade(&inner),
                config.in_flight_sweep_interval(),
                ClientInner::sweep_in_flight,
            ),
        ];

        info!(
            nodes = config.nodes.len(),
            protocol = inner.protocol.name(),
            multiplexed,
            "Client started"
        );
        Ok(Self {
            inner,
            sweeps: Mutex::new(sweeps),
        })
    }

    /// Send `name` with `body` and wait for the matching reply
    pub async fn call(&self, name: &str, body: &[u8]) -> Result<P::Message> {
        self.call_with(name, body, RequestOptions::default()).await
    }

    pub async fn call_with(
        &self,
        name: &str,
        body: &[u8],
        options: RequestOptions,
    ) -> Result<P::Message> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(NetworkError::disconnected(None, "client is shut down"));
        }

        let seq_id = inner.next_seq_id();
        let payload = inner.protocol.encode_request(seq_id, name, body)?;
        let (responder, response) = oneshot::channel();
        let request = Arc::new(Request::new(
            seq_id,
            name,
            payload,
            inner.config.receive_timeout(),
            options,
            responder,
        ));

        inner.dispatch(request);
        response.await.unwrap_or_else(|_| {
            Err(NetworkError::disconnected(None, "request dropped without a result"))
        })
    }

    pub fn register_node(&self, name: impl Into<String>, address: SocketAddr) {
        self.inner.pool.register(name, address);
    }

    pub fn unregister_node(&self, name: &str) -> bool {
        self.inner.pool.unregister(name)
    }

    pub fn pool(&self) -> &ConnectionPool<P, ClientEvents<P>> {
        &self.inner.pool
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            pending_requests: self.inner.pending.lock().len(),
            in_flight_requests: self.inner.in_flight.len(),
            live_connections: self.inner.pool.live_count(),
            registered_nodes: self.inner.pool.node_count(),
        }
    }

    /// Stop the sweeps, close every connection and fail everything
    /// outstanding with [`NetworkError::Disconnected`]
    pub fn shutdown(&self) {
        for sweep in self.sweeps.lock().drain(..) {
            sweep.abort();
        }
        self.inner.shutdown();
    }
}

impl<P: FramingProtocol> Drop for Client<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_sweep<P: FramingProtocol>(
    client: Weak<ClientInner<P>>,
    period: Duration,
    sweep: fn(&Arc<ClientInner<P>>),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(client) = client.upgrade() else {
                return;
            };
            sweep(&client);
        }
    })
}

impl<P: FramingProtocol> ClientInner<P> {
    fn next_seq_id(&self) -> u32 {
        if !self.multiplexed {
            return SYNCHRONOUS_SEQ_ID;
        }
        self.next_seq.fetch_add(1, Ordering::Relaxed) & SEQ_ID_MASK
    }

    fn in_flight_key(&self, connection: &Connection, seq_id: u32) -> InFlightKey {
        if self.multiplexed {
            InFlightKey::Multiplexed {
                connection_id: connection.id(),
                seq_id,
            }
        } else {
            InFlightKey::Synchronous {
                connection_id: connection.id(),
            }
        }
    }

    /// Route a request to a connection, or park it in the pending queue
    fn dispatch(self: &Arc<Self>, request: Pending<P::Message>) {
        if request.is_completed() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            request.fail(NetworkError::disconnected(None, "client is shut down"));
            return;
        }

        let connection = if self.multiplexed {
            self.select_connection(&request)
        } else {
            self.reserve_connection(&request)
        };
        let Some(connection) = connection else {
            trace!(seq_id = request.seq_id(), "No connection available, request pending");
            self.pending.lock().push_back(request);
            return;
        };

        request.bind(connection.id());
        let listener = Arc::new(RequestSendListener {
            request: request.clone(),
            client: Arc::downgrade(self),
        });
        let packet = Packet::new(request.payload().clone()).with_listener(listener);
        if let Err(e) = connection.send(packet) {
            // The listener has already rerouted or failed the request
            trace!(connection_id = connection.id(), error = %e, "Send rejected");
        }
    }

    fn select_connection(&self, request: &Request<P::Message>) -> Option<Arc<Connection>> {
        match request.routing_key() {
            Some(key) => self.pool.acquire_by_key(key),
            None => self.pool.acquire(),
        }
    }

    /// Synchronous protocols: claim a connection with no request in flight
    fn reserve_connection(&self, request: &Pending<P::Message>) -> Option<Arc<Connection>> {
        let attempts = match request.routing_key() {
            Some(_) => 1,
            None => self.pool.live_count().max(1),
        };

        for _ in 0..attempts {
            let connection = self.select_connection(request)?;
            let key = InFlightKey::Synchronous {
                connection_id: connection.id(),
            };
            match self.in_flight.entry(key) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(request.clone());
                    return Some(connection);
                }
            }
        }
        None
    }

    fn handle_start_sending(&self, connection: &Arc<Connection>, request: &Pending<P::Message>) {
        // Synchronous requests were reserved at dispatch
        if !self.multiplexed || request.is_completed() {
            return;
        }

        let key = self.in_flight_key(connection, request.seq_id());
        if let Some(previous) = self.in_flight.insert(key, request.clone()) {
            if !Arc::ptr_eq(&previous, request) {
                warn!(
                    connection_id = connection.id(),
                    seq_id = request.seq_id(),
                    "Sequence id reused while still in flight"
                );
                previous.fail(NetworkError::disconnected(
                    Some(connection.id()),
                    "sequence id reused before a reply arrived",
                ));
            }
        }
    }

    fn handle_reply(self: &Arc<Self>, connection: &Arc<Connection>, message: P::Message) {
        let key = self.in_flight_key(connection, message.seq_id());
        match self.in_flight.remove(&key) {
            Some((_, request)) => {
                request.complete(Ok(message));
                if !self.multiplexed {
                    self.promote_pending();
                }
            }
            None => {
                debug!(
                    connection_id = connection.id(),
                    seq_id = message.seq_id(),
                    "Reply with no matching request, dropping"
                );
            }
        }
    }

    fn handle_send_failure(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        request: &Pending<P::Message>,
        error: &NetworkError,
    ) {
        let key = self.in_flight_key(connection, request.seq_id());
        let released = self
            .in_flight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, request))
            .is_some();

        if !request.is_completed() {
            let send_timeout = self.config.send_timeout();
            let can_retry = request.allow_retry()
                && request.age() < send_timeout
                && !self.closed.load(Ordering::Acquire);

            if can_retry {
                debug!(
                    connection_id = connection.id(),
                    seq_id = request.seq_id(),
                    error = %error,
                    "Send failed, resubmitting request"
                );
                if connection.is_active() {
                    // Backpressure: retrying now could pick the same full queue
                    self.pending.lock().push_back(request.clone());
                } else {
                    self.dispatch(request.clone());
                }
            } else {
                request.fail(NetworkError::send_failed(
                    Some(connection.id()),
                    error.to_string(),
                ));
            }
        }

        if released && !self.multiplexed {
            self.promote_pending();
        }
    }

    fn handle_disconnect(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        error: Option<&NetworkError>,
    ) {
        self.pool.handle_disconnect(connection);

        let reason = error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "connection closed".to_string());
        let bound: Vec<InFlightKey> = self
            .in_flight
            .iter()
            .filter(|entry| entry.key().connection_id() == connection.id())
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0usize;
        for key in bound {
            if let Some((_, request)) = self.in_flight.remove(&key) {
                if request.fail(NetworkError::disconnected(Some(connection.id()), reason.clone())) {
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            debug!(
                connection_id = connection.id(),
                failed, "Failed in-flight requests on disconnect"
            );
        }
    }

    /// Give the oldest pending request another dispatch attempt
    fn promote_pending(self: &Arc<Self>) {
        let next = self.pending.lock().pop_front();
        if let Some(request) = next {
            self.dispatch(request);
        }
    }

    fn sweep_pending(self: &Arc<Self>) {
        let batch: Vec<Pending<P::Message>> = self.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return;
        }

        let send_timeout = self.config.send_timeout();
        let mut expired = 0usize;
        for request in batch {
            if request.is_completed() {
                continue;
            }
            if request.age() >= send_timeout {
                if request.fail(NetworkError::PendingSendTimeout {
                    timeout_ms: self.config.send_timeout_ms,
                }) {
                    expired += 1;
                }
            } else {
                self.dispatch(request);
            }
        }
        if expired > 0 {
            warn!(expired, "Requests timed out waiting for a connection");
        }
    }

    fn sweep_in_flight(self: &Arc<Self>) {
        let now = Instant::now();
        let expired: Vec<InFlightKey> = self
            .in_flight
            .iter()
            .filter(|entry| entry.value().is_receive_expired(now))
            .map(|entry| *entry.key())
            .collect();

        for key in expired {
            let Some((key, request)) = self
                .in_flight
                .remove_if(&key, |_, request| request.is_receive_expired(now))
            else {
                continue;
            };

            let error = NetworkError::ReceiveTimeout {
                connection_id: key.connection_id(),
                timeout_ms: request.receive_timeout().as_millis() as u64,
            };
            warn!(
                connection_id = key.connection_id(),
                seq_id = request.seq_id(),
                command = request.name(),
                "Request timed out waiting for reply"
            );
            request.fail(error.clone());

            // A late reply would be matched to the next request on this
            // connection, so the connection has to go
            if !self.multiplexed {
                if let Some(connection) = self.pool.host().get(key.connection_id()) {
                    connection.disconnect(Some(error));
                }
            }
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.pool.shutdown();

        let pending: Vec<Pending<P::Message>> = self.pending.lock().drain(..).collect();
        let keys: Vec<InFlightKey> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0usize;
        for request in pending {
            let error = NetworkError::disconnected(None, "client is shut down");
            failed += usize::from(request.fail(error));
        }
        for key in keys {
            if let Some((_, request)) = self.in_flight.remove(&key) {
                failed += usize::from(request.fail(NetworkError::disconnected(
                    Some(key.connection_id()),
                    "client is shut down",
                )));
            }
        }
        info!(failed, "Client shut down");
    }
}

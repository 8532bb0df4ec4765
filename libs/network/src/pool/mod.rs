//! # Connection Pool
//!
//! ## Purpose
//!
//! Keeps one connection per registered server node and hands them out by
//! round-robin or by consistent hashing on a routing key.
//!
//! ## Design
//! - Membership lives in a small locked map (`name → address, connection`)
//! - Every membership change rebuilds an immutable [`PoolSnapshot`] holding
//!   the flat connection list and the [`HashRing`]; readers clone an `Arc`
//!   and never see a half-updated pool
//! - Dropped or failed connections are retried after a jittered delay, for as
//!   long as the node stays registered
//!
//! The pool does not observe disconnects on its own: the host's handler must
//! forward them to [`ConnectionPool::handle_disconnect`].

pub mod hash_ring;

use muxwire_codec::FramingProtocol;
use muxwire_config::BackoffConfig;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::handler::ConnectionHandler;
use crate::host::Host;

pub use hash_ring::{modified_fnv1_hash, HashRing, VIRTUAL_NODES};

struct NodeSlot {
    address: SocketAddr,
    /// Bumped on every registration so stale connect loops stop
    generation: u64,
    connection: Option<Arc<Connection>>,
}

/// Immutable view of the live connections
#[derive(Debug, Default)]
pub struct PoolSnapshot {
    entries: Vec<(String, Arc<Connection>)>,
    ring: HashRing<Arc<Connection>>,
}

impl PoolSnapshot {
    fn build(nodes: &HashMap<String, NodeSlot>) -> Self {
        let mut entries: Vec<(String, Arc<Connection>)> = nodes
            .iter()
            .filter_map(|(name, slot)| slot.connection.clone().map(|c| (name.clone(), c)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let ring = HashRing::build(
            entries.iter().map(|(name, connection)| (name.as_str(), connection.clone())),
            VIRTUAL_NODES,
        );
        Self { entries, ring }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.entries.iter().map(|(_, connection)| connection)
    }

    /// Node name owning `key` on the ring
    pub fn owner_of(&self, key: &str) -> Option<&str> {
        let connection = self.ring.get(key)?;
        self.entries
            .iter()
            .find(|(_, c)| c.id() == connection.id())
            .map(|(name, _)| name.as_str())
    }
}

struct PoolInner<P: FramingProtocol, H: ConnectionHandler<P::Message>> {
    host: Arc<Host<P, H>>,
    backoff: BackoffConfig,
    connect_timeout: Duration,
    nodes: Mutex<HashMap<String, NodeSlot>>,
    snapshot: RwLock<Arc<PoolSnapshot>>,
    next: AtomicUsize,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

/// Named-node connection pool with automatic reconnect
pub struct ConnectionPool<P: FramingProtocol, H: ConnectionHandler<P::Message>> {
    inner: Arc<PoolInner<P, H>>,
}

impl<P, H> Clone for ConnectionPool<P, H>
where
    P: FramingProtocol,
    H: ConnectionHandler<P::Message>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, H> ConnectionPool<P, H>
where
    P: FramingProtocol,
    H: ConnectionHandler<P::Message>,
{
    pub fn new(host: Arc<Host<P, H>>, backoff: BackoffConfig, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                host,
                backoff,
                connect_timeout,
                nodes: Mutex::new(HashMap::new()),
                snapshot: RwLock::new(Arc::new(PoolSnapshot::default())),
                next: AtomicUsize::new(0),
                next_generation: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn host(&self) -> &Arc<Host<P, H>> {
        &self.inner.host
    }

    /// Add or re-point a node and start connecting to it
    ///
    /// Re-registering an existing name drops its current connection.
    pub fn register(&self, name: impl Into<String>, address: SocketAddr) {
        if self.inner.closed.load(Ordering::Acquire) {
            warn!("Pool is shut down, ignoring node registration");
            return;
        }

        let name = name.into();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let replaced = {
            let mut nodes = self.inner.nodes.lock();
            let previous = nodes.insert(
                name.clone(),
                NodeSlot {
                    address,
                    generation,
                    connection: None,
                },
            );
            let replaced = previous.and_then(|slot| slot.connection);
            if replaced.is_some() {
                self.inner.rebuild(&nodes);
            }
            replaced
        };

        if let Some(connection) = replaced {
            connection.disconnect(None);
        }
        info!(node = %name, %address, "Node registered");
        tokio::spawn(maintain(Arc::downgrade(&self.inner), name, generation, None));
    }

    /// Remove a node; returns `false` if it was not registered
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut nodes = self.inner.nodes.lock();
            let removed = nodes.remove(name);
            if removed.as_ref().is_some_and(|slot| slot.connection.is_some()) {
                self.inner.rebuild(&nodes);
            }
            removed
        };

        match removed {
            Some(slot) => {
                if let Some(connection) = slot.connection {
                    connection.disconnect(None);
                }
                info!(node = %name, "Node unregistered");
                true
            }
            None => false,
        }
    }

    /// Forget a closed connection and schedule its node's reconnect
    pub fn handle_disconnect(&self, connection: &Arc<Connection>) {
        self.inner.handle_disconnect(connection);
    }

    /// Next live connection in round-robin order
    pub fn acquire(&self) -> Option<Arc<Connection>> {
        let snapshot = self.snapshot();
        let len = snapshot.entries.len();
        if len == 0 {
            return None;
        }

        let start = self.inner.next.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|offset| &snapshot.entries[(start + offset) % len].1)
            .find(|connection| connection.is_active())
            .cloned()
    }

    /// Connection owning `key` on the hash ring
    pub fn acquire_by_key(&self, key: &str) -> Option<Arc<Connection>> {
        self.snapshot()
            .ring
            .get(key)
            .filter(|connection| connection.is_active())
            .cloned()
    }

    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.inner.snapshot.read().clone()
    }

    pub fn connection_for(&self, name: &str) -> Option<Arc<Connection>> {
        self.inner
            .nodes
            .lock()
            .get(name)
            .and_then(|slot| slot.connection.clone())
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.nodes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.lock().len()
    }

    pub fn live_count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Forget every node and close every connection
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let connections: Vec<Arc<Connection>> = {
            let mut nodes = self.inner.nodes.lock();
            let connections = nodes.drain().filter_map(|(_, slot)| slot.connection).collect();
            self.inner.rebuild(&nodes);
            connections
        };
        for connection in connections {
            connection.disconnect(None);
        }
        info!("Connection pool shut down");
    }
}

impl<P, H> PoolInner<P, H>
where
    P: FramingProtocol,
    H: ConnectionHandler<P::Message>,
{
    fn rebuild(&self, nodes: &HashMap<String, NodeSlot>) {
        let snapshot = Arc::new(PoolSnapshot::build(nodes));
        debug!(live = snapshot.len(), nodes = nodes.len(), "Pool snapshot rebuilt");
        *self.snapshot.write() = snapshot;
    }

    fn registered_address(&self, name: &str, generation: u64) -> Option<SocketAddr> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.nodes
            .lock()
            .get(name)
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.address)
    }

    fn attach(self: &Arc<Self>, name: &str, generation: u64, connection: Arc<Connection>) {
        enum Outcome {
            Attached,
            AlreadyClosed,
            Stale,
        }

        let outcome = {
            let mut nodes = self.nodes.lock();
            let outcome = match nodes.get_mut(name) {
                Some(slot)
                    if slot.generation == generation && !self.closed.load(Ordering::Acquire) =>
                {
                    // Checked under the lock: a close racing with us either
                    // finds the slot filled or leaves the connection inactive
                    if connection.is_active() {
                        slot.connection = Some(connection.clone());
                        Outcome::Attached
                    } else {
                        Outcome::AlreadyClosed
                    }
                }
                _ => Outcome::Stale,
            };
            if matches!(outcome, Outcome::Attached) {
                self.rebuild(&nodes);
            }
            outcome
        };

        match outcome {
            Outcome::Attached => {
                info!(node = %name, connection_id = connection.id(), "Node connected");
            }
            Outcome::AlreadyClosed => {
                self.schedule_reconnect(name.to_string(), generation, self.delay_after_drop());
            }
            Outcome::Stale => {
                debug!(node = %name, "Discarding connection for a replaced or removed node");
                connection.disconnect(None);
            }
        }
    }

    fn handle_disconnect(self: &Arc<Self>, connection: &Arc<Connection>) {
        let dropped = {
            let mut nodes = self.nodes.lock();
            let found = nodes.iter_mut().find_map(|(name, slot)| {
                let owned = slot.connection.as_ref().is_some_and(|c| c.id() == connection.id());
                owned.then(|| {
                    slot.connection = None;
                    (name.clone(), slot.generation)
                })
            });
            if found.is_some() {
                self.rebuild(&nodes);
            }
            found
        };

        if let Some((name, generation)) = dropped {
            if !self.closed.load(Ordering::Acquire) {
                let delay = self.delay_after_drop();
                info!(
                    node = %name,
                    connection_id = connection.id(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Node connection dropped"
                );
                self.schedule_reconnect(name, generation, delay);
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, name: String, generation: u64, delay: Duration) {
        tokio::spawn(maintain(Arc::downgrade(self), name, generation, Some(delay)));
    }

    fn delay_after_drop(&self) -> Duration {
        jitter(self.backoff.after_drop_min_ms, self.backoff.after_drop_max_ms)
    }

    fn delay_after_failure(&self) -> Duration {
        jitter(self.backoff.after_failure_min_ms, self.backoff.after_failure_max_ms)
    }
}

fn jitter(min_ms: u64, max_ms: u64) -> Duration {
    let (low, high) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

/// Connect loop for one node registration
async fn maintain<P, H>(
    pool: Weak<PoolInner<P, H>>,
    name: String,
    generation: u64,
    mut delay: Option<Duration>,
) where
    P: FramingProtocol,
    H: ConnectionHandler<P::Message>,
{
    loop {
        if let Some(delay) = delay.take() {
            tokio::time::sleep(delay).await;
        }

        let Some(inner) = pool.upgrade() else {
            return;
        };
        let Some(address) = inner.registered_address(&name, generation) else {
            debug!(node = %name, "Node no longer registered, stopping reconnect");
            return;
        };

        match inner.host.connect(address, inner.connect_timeout).await {
            Ok(connection) => {
                inner.attach(&name, generation, connection);
                return;
            }
            Err(e) => {
                let wait = inner.delay_after_failure();
                warn!(
                    node = %name,
                    %address,
                    error = %e,
                    retry_in_ms = wait.as_millis() as u64,
                    "Connect failed"
                );
                delay = Some(wait);
            }
        }
    }
}

//! # Duplex TCP Connection
//!
//! ## Purpose
//!
//! One established socket with an ordered, bounded send queue and a read loop
//! that reassembles framed messages. Client and server sides use the same
//! type; only the handler differs.
//!
//! ## Task Structure
//! - **Write task**: owns the write half, drains the send queue one packet at
//!   a time and tracks partial writes per packet
//! - **Read task**: owns the read half, started by [`Connection::start_receive`],
//!   feeds every read through a [`FrameReader`]
//! - **Shutdown**: [`Connection::disconnect`] flips the active flag once,
//!   fails everything still queued, wakes both tasks and fires
//!   `on_disconnected` exactly once
//!
//! Sends never block the caller. A packet is written completely before the
//! next one starts, so frames are never interleaved on the wire.

pub mod reassembly;
pub mod stats;

use muxwire_codec::FramingProtocol;
use muxwire_config::ConnectionConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use crate::error::{NetworkError, Result};
use crate::handler::{ConnectionEvents, ConnectionHandler};
use crate::packet::Packet;

pub use reassembly::FrameReader;
pub use stats::{ConnectionStats, ConnectionStatsSnapshot};

/// Unique identifier for connections within one host
pub type ConnectionId = u64;

type StartReceive = Box<dyn FnOnce(Arc<Connection>) + Send>;

struct SendState {
    queue: VecDeque<Packet>,
    /// The write task holds a popped packet
    sending: bool,
}

/// Shared handle to one live socket
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    created_at: Instant,
    active: AtomicBool,
    max_pending_packets: usize,
    send_state: Mutex<SendState>,
    send_ready: Notify,
    shutdown: watch::Sender<bool>,
    receiver: Mutex<Option<StartReceive>>,
    events: Arc<dyn ConnectionEvents>,
    stats: ConnectionStats,
}

impl Connection {
    /// Wrap an established stream and start its write task
    ///
    /// Reading does not begin until [`Connection::start_receive`], so the
    /// caller can register the connection before any message arrives.
    pub fn open<P, H>(
        id: ConnectionId,
        stream: TcpStream,
        config: &ConnectionConfig,
        protocol: Arc<P>,
        handler: Arc<H>,
    ) -> Result<Arc<Self>>
    where
        P: FramingProtocol,
        H: ConnectionHandler<P::Message>,
    {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| NetworkError::io("read peer address", e))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| NetworkError::io("read local address", e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(connection_id = id, error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let (shutdown, _) = watch::channel(false);
        let events: Arc<dyn ConnectionEvents> = handler.clone();

        let socket_buffer_size = config.socket_buffer_size;
        let message_buffer_size = config.message_buffer_size;
        let start_receive: StartReceive = Box::new(move |connection: Arc<Connection>| {
            tokio::spawn(read_loop(
                connection,
                read_half,
                FrameReader::new(protocol, message_buffer_size),
                handler,
                socket_buffer_size,
            ));
        });

        let connection = Arc::new(Self {
            id,
            peer_addr,
            local_addr,
            created_at: Instant::now(),
            active: AtomicBool::new(true),
            max_pending_packets: config.max_pending_packets,
            send_state: Mutex::new(SendState {
                queue: VecDeque::new(),
                sending: false,
            }),
            send_ready: Notify::new(),
            shutdown,
            receiver: Mutex::new(Some(start_receive)),
            events,
            stats: ConnectionStats::new(),
        });

        tokio::spawn(write_loop(connection.clone(), write_half));
        debug!(connection_id = id, peer = %peer_addr, "Connection opened");
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Packets queued or currently being written
    pub fn pending_packets(&self) -> usize {
        let state = self.send_state.lock();
        state.queue.len() + usize::from(state.sending)
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Start the read task; later calls are no-ops
    pub fn start_receive(self: &Arc<Self>) {
        let start = self.receiver.lock().take();
        match start {
            Some(start) if self.is_active() => start(self.clone()),
            Some(_) => trace!(connection_id = self.id, "Receive skipped on closed connection"),
            None => {}
        }
    }

    /// Enqueue a packet for ordered delivery
    ///
    /// On rejection the packet's listener is told through `on_send_failed`
    /// and the same error is returned.
    pub fn send(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let rejected = {
            let mut state = self.send_state.lock();
            if !self.is_active() {
                Some((
                    packet,
                    NetworkError::disconnected(Some(self.id), "connection is closed"),
                ))
            } else if state.queue.len() >= self.max_pending_packets {
                Some((
                    packet,
                    NetworkError::send_failed(
                        Some(self.id),
                        format!("send queue full ({} packets)", self.max_pending_packets),
                    ),
                ))
            } else {
                state.queue.push_back(packet);
                None
            }
        };

        match rejected {
            None => {
                self.send_ready.notify_one();
                Ok(())
            }
            Some((packet, error)) => {
                self.stats.record_send_error();
                packet.notify_failed(self, &error);
                Err(error)
            }
        }
    }

    /// Close the connection; only the first call has any effect
    ///
    /// Returns `true` for the call that performed the close.
    pub fn disconnect(self: &Arc<Self>, error: Option<NetworkError>) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);

        match &error {
            Some(e) => debug!(
                connection_id = self.id,
                peer = %self.peer_addr,
                error = %e,
                "Connection closing"
            ),
            None => debug!(connection_id = self.id, peer = %self.peer_addr, "Connection closing"),
        }

        self.fail_queued(&NetworkError::disconnected(
            Some(self.id),
            "connection closed before packet was sent",
        ));
        self.events.on_disconnected(self, error.as_ref());
        true
    }

    fn next_packet(&self) -> Option<Packet> {
        let mut state = self.send_state.lock();
        let next = state.queue.pop_front();
        state.sending = next.is_some();
        next
    }

    fn fail_queued(self: &Arc<Self>, error: &NetworkError) {
        let drained: Vec<Packet> = {
            let mut state = self.send_state.lock();
            state.queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        trace!(connection_id = self.id, count = drained.len(), "Failing queued packets");
        for packet in drained {
            self.stats.record_send_error();
            packet.notify_failed(self, error);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn write_packet(
    writer: &mut OwnedWriteHalf,
    packet: &mut Packet,
    id: ConnectionId,
) -> Result<()> {
    while !packet.is_complete() {
        let written = writer
            .write(packet.remaining())
            .await
            .map_err(|e| NetworkError::send_failed(Some(id), e.to_string()))?;
        if written == 0 {
            return Err(NetworkError::send_failed(Some(id), "socket accepted zero bytes"));
        }
        packet.advance(written);
    }
    Ok(())
}

fn closed_while_sending(id: ConnectionId) -> NetworkError {
    NetworkError::disconnected(Some(id), "connection closed while sending")
}

async fn write_loop(connection: Arc<Connection>, mut writer: OwnedWriteHalf) {
    let mut shutdown = connection.shutdown.subscribe();

    loop {
        let mut packet = match connection.next_packet() {
            Some(packet) => packet,
            None => {
                if !connection.is_active() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|closed| *closed) => break,
                    _ = connection.send_ready.notified() => continue,
                }
            }
        };

        // A listener may close the connection from on_start_sending
        let result = if !connection.is_active() {
            Err(closed_while_sending(connection.id))
        } else {
            packet.notify_start_sending(&connection);
            if !connection.is_active() {
                Err(closed_while_sending(connection.id))
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|closed| *closed) => {
                        Err(closed_while_sending(connection.id))
                    }
                    result = write_packet(&mut writer, &mut packet, connection.id) => result,
                }
            }
        };

        match result {
            Ok(()) => {
                connection.send_state.lock().sending = false;
                connection.stats.record_send(packet.len(), packet.age());
                packet.notify_sent(&connection);
                connection.events.on_sent(&connection, packet.len());
            }
            Err(error) => {
                connection.send_state.lock().sending = false;
                connection.stats.record_send_error();
                packet.notify_failed(&connection, &error);
                if connection.is_active() {
                    connection.events.on_error(&connection, &error);
                    connection.disconnect(Some(error));
                }
                break;
            }
        }
    }

    // Anything enqueued between the last pop and the close
    connection.fail_queued(&NetworkError::disconnected(
        Some(connection.id),
        "connection closed before packet was sent",
    ));
    if let Err(e) = writer.shutdown().await {
        trace!(connection_id = connection.id, error = %e, "Write half shutdown failed");
    }
    trace!(connection_id = connection.id, "Write task ended");
}

async fn read_loop<P, H>(
    connection: Arc<Connection>,
    mut reader: OwnedReadHalf,
    mut frames: FrameReader<P>,
    handler: Arc<H>,
    socket_buffer_size: usize,
) where
    P: FramingProtocol,
    H: ConnectionHandler<P::Message>,
{
    let mut shutdown = connection.shutdown.subscribe();
    let mut read_buffer = vec![0u8; socket_buffer_size.max(1)];

    while connection.is_active() {
        let read = tokio::select! {
            read = reader.read(&mut read_buffer) => read,
            _ = shutdown.wait_for(|closed| *closed) => break,
        };

        match read {
            Ok(0) => {
                debug!(connection_id = connection.id, "Peer closed connection");
                connection.disconnect(None);
                break;
            }
            Ok(n) => {
                connection.stats.record_read(n);
                let result = frames.feed(&read_buffer[..n], |message| {
                    connection.stats.record_message();
                    handler.on_message(&connection, message);
                });
                if let Err(e) = result {
                    warn!(
                        connection_id = connection.id,
                        peer = %connection.peer_addr,
                        error = %e,
                        "Protocol error, closing connection"
                    );
                    let error = NetworkError::BadProtocol(e);
                    handler.on_error(&connection, &error);
                    connection.disconnect(Some(error));
                    break;
                }
            }
            Err(e) => {
                let error = NetworkError::io("receive", e);
                handler.on_error(&connection, &error);
                connection.disconnect(Some(error));
                break;
            }
        }
    }

    trace!(
        connection_id = connection.id,
        carried = frames.pending_bytes(),
        "Read task ended"
    );
}

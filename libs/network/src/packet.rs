//! Outgoing packets and send notifications

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::error::NetworkError;

/// Observer of one packet's trip through a connection's send queue
///
/// Exactly one of [`SendListener::on_sent`] or [`SendListener::on_send_failed`]
/// is called per packet. [`SendListener::on_start_sending`] fires before the
/// first byte is written and is skipped for packets that fail while queued.
pub trait SendListener: Send + Sync + 'static {
    fn on_start_sending(&self, _connection: &Arc<Connection>) {}

    fn on_sent(&self, _connection: &Arc<Connection>) {}

    fn on_send_failed(&self, connection: &Arc<Connection>, error: &NetworkError);
}

/// Encoded bytes queued for one connection
pub struct Packet {
    payload: Bytes,
    sent_size: usize,
    created_at: Instant,
    listener: Option<Arc<dyn SendListener>>,
}

impl Packet {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            sent_size: 0,
            created_at: Instant::now(),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn SendListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Bytes already handed to the socket
    pub fn sent_size(&self) -> usize {
        self.sent_size
    }

    /// Bytes still waiting to be written
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.sent_size..]
    }

    pub fn is_complete(&self) -> bool {
        self.sent_size >= self.payload.len()
    }

    pub(crate) fn advance(&mut self, written: usize) {
        self.sent_size = (self.sent_size + written).min(self.payload.len());
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn notify_start_sending(&self, connection: &Arc<Connection>) {
        if let Some(listener) = &self.listener {
            listener.on_start_sending(connection);
        }
    }

    pub(crate) fn notify_sent(&self, connection: &Arc<Connection>) {
        if let Some(listener) = &self.listener {
            listener.on_sent(connection);
        }
    }

    pub(crate) fn notify_failed(&self, connection: &Arc<Connection>, error: &NetworkError) {
        if let Some(listener) = &self.listener {
            listener.on_send_failed(connection, error);
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.payload.len())
            .field("sent_size", &self.sent_size)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

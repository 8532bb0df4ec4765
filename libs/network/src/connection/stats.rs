//! Per-connection traffic counters
//!
//! Lock-free counters updated from the read and write tasks, plus a small
//! lock for the last-activity timestamp. Snapshots are taken without stopping
//! either task.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live counters owned by one [`super::Connection`]
#[derive(Debug)]
pub struct ConnectionStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,

    /// Time from enqueue to last byte written
    send_latency_sum_ns: AtomicU64,
    send_latency_max_ns: AtomicU64,

    last_send: RwLock<Option<Instant>>,
    last_receive: RwLock<Option<Instant>>,
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub avg_send_latency_ns: u64,
    pub max_send_latency_ns: u64,
    pub last_activity: Option<Instant>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            send_latency_sum_ns: AtomicU64::new(0),
            send_latency_max_ns: AtomicU64::new(0),
            last_send: RwLock::new(None),
            last_receive: RwLock::new(None),
        }
    }

    /// Record a fully written packet
    #[inline]
    pub fn record_send(&self, bytes: usize, queued_for: Duration) {
        let latency_ns = queued_for.as_nanos().min(u64::MAX as u128) as u64;
        self.messages_sent.fetch_add(1, Ordering::Release);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Release);
        self.send_latency_sum_ns.fetch_add(latency_ns, Ordering::Release);
        self.send_latency_max_ns.fetch_max(latency_ns, Ordering::AcqRel);
        *self.last_send.write() = Some(Instant::now());
    }

    /// Record bytes read from the socket
    #[inline]
    pub fn record_read(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Release);
        *self.last_receive.write() = Some(Instant::now());
    }

    /// Record one complete message delivered to the handler
    #[inline]
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        let messages_sent = self.messages_sent.load(Ordering::Acquire);
        let latency_sum = self.send_latency_sum_ns.load(Ordering::Acquire);

        ConnectionStatsSnapshot {
            messages_sent,
            messages_received: self.messages_received.load(Ordering::Acquire),
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            bytes_received: self.bytes_received.load(Ordering::Acquire),
            send_errors: self.send_errors.load(Ordering::Acquire),
            avg_send_latency_ns: if messages_sent > 0 {
                latency_sum / messages_sent
            } else {
                0
            },
            max_send_latency_ns: self.send_latency_max_ns.load(Ordering::Acquire),
            last_activity: self.last_activity(),
        }
    }

    fn last_activity(&self) -> Option<Instant> {
        let last_send = *self.last_send.read();
        let last_recv = *self.last_receive.read();

        match (last_send, last_recv) {
            (Some(s), Some(r)) => Some(s.max(r)),
            (s, r) => s.or(r),
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

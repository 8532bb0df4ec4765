//! Outstanding request state

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::connection::ConnectionId;
use crate::error::{NetworkError, Result};

/// Per-call overrides
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Route by consistent hash instead of round-robin
    pub routing_key: Option<String>,
    /// Overrides the client's receive timeout
    pub receive_timeout: Option<Duration>,
    /// Re-dispatch after a send failure while the send timeout allows
    pub allow_retry: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            routing_key: None,
            receive_timeout: None,
            allow_retry: true,
        }
    }
}

impl RequestOptions {
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.allow_retry = false;
        self
    }
}

/// Key of the in-flight table
///
/// Multiplexed protocols correlate by connection and sequence id. Synchronous
/// protocols allow one request per connection, so the connection alone is
/// the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InFlightKey {
    Multiplexed { connection_id: ConnectionId, seq_id: u32 },
    Synchronous { connection_id: ConnectionId },
}

impl InFlightKey {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            InFlightKey::Multiplexed { connection_id, .. } => *connection_id,
            InFlightKey::Synchronous { connection_id } => *connection_id,
        }
    }
}

const UNBOUND: u64 = 0;

/// One call waiting for a connection or a reply
///
/// Completion is exactly-once: the first of reply, timeout or failure wins
/// and every later attempt is ignored.
pub struct Request<M> {
    seq_id: u32,
    name: String,
    payload: Bytes,
    created_at: Instant,
    receive_timeout: Duration,
    allow_retry: bool,
    routing_key: Option<String>,
    sent_at: Mutex<Option<Instant>>,
    connection_id: AtomicU64,
    completed: AtomicBool,
    responder: Mutex<Option<oneshot::Sender<Result<M>>>>,
}

impl<M> Request<M> {
    pub(crate) fn new(
        seq_id: u32,
        name: &str,
        payload: Bytes,
        receive_timeout: Duration,
        options: RequestOptions,
        responder: oneshot::Sender<Result<M>>,
    ) -> Self {
        Self {
            seq_id,
            name: name.to_string(),
            payload,
            created_at: Instant::now(),
            receive_timeout: options.receive_timeout.unwrap_or(receive_timeout),
            allow_retry: options.allow_retry,
            routing_key: options.routing_key,
            sent_at: Mutex::new(None),
            connection_id: AtomicU64::new(UNBOUND),
            completed: AtomicBool::new(false),
            responder: Mutex::new(Some(responder)),
        }
    }

    pub fn seq_id(&self) -> u32 {
        self.seq_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn allow_retry(&self) -> bool {
        self.allow_retry
    }

    /// Time since the call was made
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self.connection_id.load(Ordering::Acquire) {
            UNBOUND => None,
            id => Some(id),
        }
    }

    pub(crate) fn bind(&self, connection_id: ConnectionId) {
        self.connection_id.store(connection_id, Ordering::Release);
        *self.sent_at.lock() = None;
    }

    pub(crate) fn mark_sent(&self) {
        *self.sent_at.lock() = Some(Instant::now());
    }

    pub fn sent_at(&self) -> Option<Instant> {
        *self.sent_at.lock()
    }

    /// Written to the socket and waiting longer than its receive timeout
    pub fn is_receive_expired(&self, now: Instant) -> bool {
        self.sent_at()
            .is_some_and(|sent| now.saturating_duration_since(sent) >= self.receive_timeout)
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Deliver the outcome; returns `false` if the request already completed
    pub fn complete(&self, result: Result<M>) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(responder) = self.responder.lock().take() {
            // Caller may have stopped waiting
            let _ = responder.send(result);
        }
        true
    }

    pub(crate) fn fail(&self, error: NetworkError) -> bool {
        self.complete(Err(error))
    }
}

impl<M> std::fmt::Debug for Request<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("seq_id", &self.seq_id)
            .field("name", &self.name)
            .field("connection_id", &self.connection_id())
            .field("completed", &self.is_completed())
            .finish()
    }
}

//! Connection lifecycle callbacks
//!
//! [`ConnectionEvents`] carries the message-independent events a connection
//! raises; [`ConnectionHandler`] adds delivery of parsed messages. Callbacks
//! run on the connection's read and write tasks and must not block.

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::NetworkError;

pub trait ConnectionEvents: Send + Sync + 'static {
    /// Connection registered and about to start receiving
    fn on_connected(&self, _connection: &Arc<Connection>) {}

    /// A packet was fully written to the socket
    fn on_sent(&self, _connection: &Arc<Connection>, _bytes: usize) {}

    /// Fatal error observed just before the connection closes
    fn on_error(&self, _connection: &Arc<Connection>, _error: &NetworkError) {}

    /// Called exactly once per connection. `error` is `None` for a clean close
    fn on_disconnected(&self, _connection: &Arc<Connection>, _error: Option<&NetworkError>) {}
}

pub trait ConnectionHandler<M>: ConnectionEvents {
    /// One complete message, in stream order
    fn on_message(&self, connection: &Arc<Connection>, message: M);
}

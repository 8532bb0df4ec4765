//! # Server Dispatch
//!
//! A [`Server`] is a listening [`Host`] whose handler hands each parsed
//! request to a [`Dispatch`] implementation on its own task. Replies go back
//! through a [`ReplySink`], which encodes them with the connection's protocol
//! so the reply carries the request's sequence id.
//!
//! [`CommandTable`] is the stock dispatcher: an explicit name → command map
//! filled in at startup.

use async_trait::async_trait;
use bytes::Bytes;
use muxwire_codec::{FramingProtocol, WireMessage};
use muxwire_config::ListenerConfig;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{NetworkError, Result};
use crate::handler::{ConnectionEvents, ConnectionHandler};
use crate::host::{Host, ListenerHandle};
use crate::packet::Packet;

/// Handle for answering one request on the connection it arrived on
pub struct ReplySink<P: FramingProtocol> {
    connection: Arc<Connection>,
    protocol: Arc<P>,
}

impl<P: FramingProtocol> ReplySink<P> {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Encode `body` as the reply to `request` and queue it
    pub fn reply(&self, request: &P::Message, body: &[u8]) -> Result<()> {
        let payload = self.protocol.encode_reply(request, body)?;
        self.connection.send(Packet::new(payload))
    }
}

/// Server-side request processing
#[async_trait]
pub trait Dispatch<P: FramingProtocol>: Send + Sync + 'static {
    async fn dispatch(&self, reply: ReplySink<P>, message: P::Message);
}

/// One named command in a [`CommandTable`]
///
/// Returning `None` sends no reply.
#[async_trait]
pub trait Command<M: WireMessage>: Send + Sync + 'static {
    async fn execute(&self, message: &M) -> Option<Bytes>;
}

/// Adapts a plain function into a [`Command`]
pub struct FnCommand<F>(pub F);

#[async_trait]
impl<M, F> Command<M> for FnCommand<F>
where
    M: WireMessage,
    F: Fn(&M) -> Option<Bytes> + Send + Sync + 'static,
{
    async fn execute(&self, message: &M) -> Option<Bytes> {
        (self.0)(message)
    }
}

/// Name → command registry
pub struct CommandTable<P: FramingProtocol> {
    commands: HashMap<String, Arc<dyn Command<P::Message>>>,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: FramingProtocol> CommandTable<P> {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            _protocol: PhantomData,
        }
    }

    /// Register `command` under `name`, replacing any previous entry
    pub fn register(
        &mut self,
        name: impl Into<String>,
        command: impl Command<P::Message>,
    ) -> &mut Self {
        let name = name.into();
        if self.commands.insert(name.clone(), Arc::new(command)).is_some() {
            warn!(command = %name, "Command registered twice, keeping the latest");
        }
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&P::Message) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.register(name, FnCommand(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl<P: FramingProtocol> Default for CommandTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P: FramingProtocol> Dispatch<P> for CommandTable<P> {
    async fn dispatch(&self, reply: ReplySink<P>, message: P::Message) {
        let Some(command) = self.commands.get(message.name()).cloned() else {
            warn!(
                connection_id = reply.connection().id(),
                command = message.name(),
                "Unknown command"
            );
            return;
        };

        if let Some(body) = command.execute(&message).await {
            if let Err(e) = reply.reply(&message, &body) {
                debug!(
                    connection_id = reply.connection().id(),
                    command = message.name(),
                    error = %e,
                    "Reply not sent"
                );
            }
        }
    }
}

/// Connection handler that spawns one dispatch task per message
pub struct ServerHandler<P, D> {
    protocol: Arc<P>,
    dispatcher: Arc<D>,
}

impl<P, D> ConnectionEvents for ServerHandler<P, D>
where
    P: FramingProtocol,
    D: Dispatch<P>,
{
    fn on_connected(&self, connection: &Arc<Connection>) {
        debug!(connection_id = connection.id(), peer = %connection.peer_addr(), "Client connected");
    }

    fn on_disconnected(&self, connection: &Arc<Connection>, error: Option<&NetworkError>) {
        match error {
            Some(e) => debug!(connection_id = connection.id(), error = %e, "Client disconnected"),
            None => debug!(connection_id = connection.id(), "Client disconnected"),
        }
    }
}

impl<P, D> ConnectionHandler<P::Message> for ServerHandler<P, D>
where
    P: FramingProtocol,
    D: Dispatch<P>,
{
    fn on_message(&self, connection: &Arc<Connection>, message: P::Message) {
        let dispatcher = self.dispatcher.clone();
        let reply = ReplySink {
            connection: connection.clone(),
            protocol: self.protocol.clone(),
        };
        tokio::spawn(async move {
            dispatcher.dispatch(reply, message).await;
        });
    }
}

/// Lower `protocol`'s frame limit to the configured maximum
///
/// A protocol built with a tighter limit keeps it.
pub(crate) fn apply_frame_limit<P: FramingProtocol>(protocol: P, configured_max: usize) -> P {
    let limit = configured_max.min(protocol.max_message_size());
    if limit == protocol.max_message_size() {
        return protocol;
    }
    debug!(
        protocol = protocol.name(),
        limit, "Frame limit lowered to configured maximum"
    );
    protocol.with_max_message_size(limit)
}

/// Listening side: a host plus a dispatcher
pub struct Server<P: FramingProtocol, D: Dispatch<P>> {
    host: Arc<Host<P, ServerHandler<P, D>>>,
    bind_address: SocketAddr,
    listener: Option<ListenerHandle>,
}

impl<P, D> Server<P, D>
where
    P: FramingProtocol,
    D: Dispatch<P>,
{
    pub fn new(protocol: P, dispatcher: D, config: ListenerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NetworkError::configuration(format!("{:#}", e)))?;

        let protocol = Arc::new(apply_frame_limit(protocol, config.connection.max_message_size));
        let handler = Arc::new(ServerHandler {
            protocol: protocol.clone(),
            dispatcher: Arc::new(dispatcher),
        });
        let host = Host::new(protocol, handler, config.connection, config.max_connections);

        Ok(Self {
            host: Arc::new(host),
            bind_address: config.bind_address,
            listener: None,
        })
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr());
        }
        let listener = self.host.listen(self.bind_address).await?;
        let local_addr = listener.local_addr();
        self.listener = Some(listener);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(ListenerHandle::local_addr)
    }

    pub fn host(&self) -> &Arc<Host<P, ServerHandler<P, D>>> {
        &self.host
    }

    /// Stop accepting and close every client connection
    pub fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop();
            info!(local_addr = %listener.local_addr(), "Server stopped");
        }
        self.host.disconnect_all();
    }
}

impl<P, D> Drop for Server<P, D>
where
    P: FramingProtocol,
    D: Dispatch<P>,
{
    fn drop(&mut self) {
        self.stop();
    }
}

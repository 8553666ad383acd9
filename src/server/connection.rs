//! Per-connection server state and the bridge from the driver task into the
//! server registry.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ServerContext;
use crate::connection::{
    Command, ConnectionHandler, ConnectionState, Outbox, StateCell,
};
use crate::element::Element;
use crate::error::EngineError;
use crate::jid::Jid;
use crate::registry::{lock, Delivery};
use crate::stream::{Outbound, StreamEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    Tcp,
    WebSocket,
}

/// What the server knows about one client stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Bare JID after SASL, full JID after resource binding.
    pub jid: Option<Jid>,
    pub authenticated: bool,
    pub session_established: bool,
    pub secured: bool,
    pub stream_id: Option<String>,
    pub transport: TransportKind,
}

pub struct ServerConnection {
    id: u64,
    peer: SocketAddr,
    state: StateCell<ConnectionState>,
    context: Mutex<ConnectionContext>,
    outbox: Outbox,
}

impl ServerConnection {
    pub(crate) fn new(peer: SocketAddr, transport: TransportKind, outbox: Outbox) -> Self {
        Self {
            id: outbox.conn_id(),
            peer,
            state: StateCell::new(ConnectionState::Connected),
            context: Mutex::new(ConnectionContext {
                transport,
                ..ConnectionContext::default()
            }),
            outbox,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> &StateCell<ConnectionState> {
        &self.state
    }

    /// Snapshot of the connection context.
    pub fn context(&self) -> ConnectionContext {
        lock(&self.context).clone()
    }

    pub fn update_context<R>(&self, update: impl FnOnce(&mut ConnectionContext) -> R) -> R {
        update(&mut lock(&self.context))
    }

    pub fn jid(&self) -> Option<Jid> {
        lock(&self.context).jid.clone()
    }

    pub fn send(&self, outbound: impl Into<Outbound>) -> Result<(), EngineError> {
        self.outbox.send(outbound)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Close the stream. Repeated calls are no-ops.
    pub fn close(&self) {
        if self
            .state
            .transition(ConnectionState::Disconnecting, &ConnectionState::ACTIVE)
            .is_ok()
        {
            debug!(conn_id = self.id, "Closing connection");
            if let Err(e) = self.outbox.close() {
                debug!(conn_id = self.id, error = %e, "Driver already gone, nothing to close");
            }
        }
    }

    /// Upgrade the transport once `<proceed/>` has been queued.
    pub(crate) fn start_tls(&self) -> Result<(), EngineError> {
        self.state
            .transition(ConnectionState::Securing, &[ConnectionState::Connected])?;
        self.outbox.command(Command::StartTls)
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Payload of the server registry: a delivery plus where it came from.
pub struct Inbound {
    pub server: Arc<ServerContext>,
    pub connection: Arc<ServerConnection>,
    pub delivery: Delivery,
}

impl Inbound {
    pub fn stanza(&self) -> Option<&Element> {
        self.delivery.stanza()
    }

    pub fn reply(&self, outbound: impl Into<Outbound>) -> Result<(), EngineError> {
        self.connection.send(outbound)
    }
}

pub(crate) struct ServerConnectionHandler {
    pub server: Arc<ServerContext>,
    pub connection: Arc<ServerConnection>,
}

impl ServerConnectionHandler {
    pub(crate) fn publish(&self, delivery: Delivery) {
        let inbound = Inbound {
            server: self.server.clone(),
            connection: self.connection.clone(),
            delivery,
        };
        let mut handled = 0;
        for key in inbound.delivery.keys() {
            handled += self.server.registry().publish(&key, &inbound);
        }
        if handled == 0 {
            if let Some(stanza) = inbound.stanza() {
                debug!(conn_id = self.connection.id, stanza = stanza.name(), "No handler for stanza");
            }
        }
    }
}

impl ConnectionHandler for ServerConnectionHandler {
    fn on_event(&self, event: StreamEvent) {
        self.publish(Delivery::Stream(event));
    }

    fn on_tls(&self, result: Result<(), EngineError>) {
        match result {
            Ok(()) => {
                self.connection.update_context(|ctx| ctx.secured = true);
                if let Err(e) = self
                    .connection
                    .state
                    .transition(ConnectionState::Connected, &[ConnectionState::Securing])
                {
                    debug!(conn_id = self.connection.id, error = %e, "Secured stream no longer negotiating");
                }
                info!(conn_id = self.connection.id, "Client stream secured");
            }
            Err(e) => {
                warn!(conn_id = self.connection.id, error = %e, "STARTTLS failed, closing");
                self.connection.close();
            }
        }
    }

    fn on_closed(&self, cause: Option<EngineError>) {
        self.connection.state.force(ConnectionState::Disconnected);
        match &cause {
            Some(e) => info!(conn_id = self.connection.id, peer = %self.connection.peer, error = %e, "Connection lost"),
            None => info!(conn_id = self.connection.id, peer = %self.connection.peer, "Connection closed"),
        }
        self.publish(Delivery::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::next_connection_id;
    use crate::server::XmppServer;

    fn connection() -> (Arc<ServerConnection>, tokio::sync::mpsc::UnboundedReceiver<Command>) {
        let (outbox, commands) = Outbox::channel(next_connection_id());
        let peer: SocketAddr = "127.0.0.1:40001".parse().expect("addr");
        (Arc::new(ServerConnection::new(peer, TransportKind::Tcp, outbox)), commands)
    }

    #[test]
    fn test_close_after_driver_exit_still_disconnects() {
        let (connection, commands) = connection();
        drop(commands);

        connection.close();
        assert_eq!(connection.state().get(), ConnectionState::Disconnecting);
        connection.close();
        assert_eq!(connection.state().get(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_late_tls_success_keeps_closing_state() {
        let server = XmppServer::builder("example.org").build();
        let (connection, mut commands) = connection();
        connection.start_tls().expect("starttls");
        assert!(matches!(commands.try_recv(), Ok(Command::StartTls)));
        connection.close();

        let handler = ServerConnectionHandler {
            server: server.context().clone(),
            connection: connection.clone(),
        };
        handler.on_tls(Ok(()));
        assert!(connection.context().secured);
        assert_eq!(connection.state().get(), ConnectionState::Disconnecting);
    }
}

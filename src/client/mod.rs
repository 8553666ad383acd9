//! XMPP client: connect, log in, exchange stanzas, disconnect.
//!
//! ```no_run
//! # async fn run() -> Result<(), xmpp_engine::EngineError> {
//! use xmpp_engine::client::{ClientConfig, XmppClient};
//!
//! let client = XmppClient::new(ClientConfig::default());
//! client.connect_domain("example.org").await?;
//! let jid = client.login("alice", "secret", Some("desk"))?.await?;
//! println!("logged in as {}", jid);
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod dns;
mod handshake;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tracing::{info, warn};

pub use dns::{parse_server_input, resolve_client_endpoints, Endpoint, ParsedServer};
pub use handshake::PendingLogin;

use crate::connection::{
    self, next_connection_id, tls, ConnectionHandler, ConnectionState, DriverConfig, Lifecycle,
    Outbox, StateCell, TlsUpgrade,
};
use crate::error::EngineError;
use crate::jid::Jid;
use crate::registry::{
    lock, Delivery, DispatchKey, DispatchRegistry, HandlerResult, Registration, RegistrationSet,
};
use crate::stream::{codec::DEFAULT_MAX_STANZA_SIZE, stream_open, Outbound};
use handshake::ClientSession;

/// Client settings. Every field has a default, so partial documents load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Refuse to authenticate over a plain-text stream.
    pub require_tls: bool,
    pub connect_timeout_secs: u64,
    /// How long `disconnect` waits for the server's closing tag.
    pub close_timeout_secs: u64,
    pub max_stanza_size: usize,
    pub read_buffer_size: usize,
    /// Skip certificate verification (self-signed development servers).
    pub accept_invalid_certs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            require_tls: false,
            connect_timeout_secs: 15,
            close_timeout_secs: 5,
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            read_buffer_size: 8192,
            accept_invalid_certs: false,
        }
    }
}

impl ClientConfig {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            read_buffer_size: self.read_buffer_size,
            max_stanza_size: self.max_stanza_size,
            close_timeout: Duration::from_secs(self.close_timeout_secs),
        }
    }
}

/// A unit of client functionality wired in at connection time.
pub trait ClientModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register handlers for a new connection.
    fn install(&self, ctx: &ClientModuleContext);

    /// Called when the connection ends, before the module's registrations
    /// are dropped.
    fn uninstall(&self, _ctx: &ClientModuleContext) {}
}

/// What a [`ClientModule`] can reach on its connection. Registrations made
/// through the context are released when the connection ends.
pub struct ClientModuleContext {
    registry: Arc<DispatchRegistry<Delivery>>,
    outbox: Outbox,
    registrations: RegistrationSet,
}

impl ClientModuleContext {
    fn new(registry: Arc<DispatchRegistry<Delivery>>, outbox: Outbox) -> Self {
        Self {
            registry,
            outbox,
            registrations: RegistrationSet::new(),
        }
    }

    pub fn register<F>(&self, key: DispatchKey, handler: F)
    where
        F: Fn(&Delivery) -> HandlerResult + Send + Sync + 'static,
    {
        self.registrations.push(self.registry.register(key, handler));
    }

    pub fn send(&self, outbound: impl Into<Outbound>) -> Result<(), EngineError> {
        self.outbox.send(outbound)
    }

    /// Outbox of the connection, for handlers that reply.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry<Delivery>> {
        &self.registry
    }

    fn release(&self) {
        self.registrations.cancel_all(&self.registry);
    }
}

pub struct XmppClient {
    config: ClientConfig,
    registry: Arc<DispatchRegistry<Delivery>>,
    modules: Vec<Arc<dyn ClientModule>>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    state: Arc<StateCell<ConnectionState>>,
    session: Mutex<Option<Arc<ClientSession>>>,
}

impl XmppClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            registry: Arc::new(DispatchRegistry::new()),
            modules: Vec::new(),
            tls_config: None,
            state: Arc::new(StateCell::new(ConnectionState::Disconnected)),
            session: Mutex::new(None),
        }
    }

    /// Add a module; modules are installed in the order they were added.
    pub fn with_module(mut self, module: impl ClientModule + 'static) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// Use this TLS configuration instead of the system trust store.
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registry shared by every connection of this client. Handlers
    /// registered here directly outlive individual connections.
    pub fn registry(&self) -> &Arc<DispatchRegistry<Delivery>> {
        &self.registry
    }

    /// Shorthand for registering on [`registry`](Self::registry).
    pub fn register<F>(&self, key: DispatchKey, handler: F) -> Registration
    where
        F: Fn(&Delivery) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry.register(key, handler)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Full JID assigned by the server once bound.
    pub fn jid(&self) -> Option<Jid> {
        self.current_session().and_then(|s| s.jid())
    }

    /// Whether the current connection runs over TLS.
    pub fn is_secured(&self) -> bool {
        self.current_session().is_some_and(|s| s.is_secured())
    }

    fn current_session(&self) -> Option<Arc<ClientSession>> {
        lock(&self.session).clone()
    }

    fn tls_upgrade(&self, domain: &str) -> TlsUpgrade {
        let config = match &self.tls_config {
            Some(config) => Ok(config.clone()),
            None => tls::client_tls_config(self.config.accept_invalid_certs),
        };
        match config.and_then(|config| TlsUpgrade::client(config, domain)) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                warn!(domain, error = %e, "STARTTLS unavailable");
                TlsUpgrade::Unavailable
            }
        }
    }

    /// Connect to `host:port` and open a stream to `domain`.
    pub async fn connect(&self, host: &str, port: u16, domain: &str) -> Result<(), EngineError> {
        self.state
            .transition(ConnectionState::Connecting, &[ConnectionState::Disconnected])?;

        let tls = self.tls_upgrade(domain);
        let (outbox, commands) = Outbox::channel(next_connection_id());
        let session = ClientSession::new(
            domain,
            &self.config,
            tls.is_available(),
            self.state.clone(),
            self.registry.clone(),
            outbox,
            self.modules.clone(),
        );
        *lock(&self.session) = Some(session.clone());
        let conn_id = session.conn_id();
        info!(conn_id, host, port, domain, "Connecting");

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(conn_id, host, port, error = %e, "TCP connect failed");
                session.on_closed(None);
                return Err(e.into());
            }
            Err(_) => {
                warn!(conn_id, host, port, timeout_secs = connect_timeout.as_secs(), "TCP connect timed out");
                session.on_closed(None);
                return Err(EngineError::Timeout(connect_timeout));
            }
        };
        let _ = stream.set_nodelay(true);

        if let Err(e) = self
            .state
            .transition(ConnectionState::Connected, &[ConnectionState::Connecting])
        {
            // disconnect() won the race while the socket was connecting
            info!(conn_id, error = %e, "Connection abandoned");
            session.on_closed(None);
            return Err(EngineError::ConnectionClosed);
        }
        info!(conn_id, host, port, "TCP connected");

        session.start();
        session
            .outbox()
            .send(stream_open(None, Some(domain), None))?;
        tokio::spawn(connection::run_stream(
            conn_id,
            Box::new(stream),
            commands,
            session,
            tls,
            self.config.driver_config(),
        ));
        Ok(())
    }

    /// Connect to `server`, which is either an explicit `host:port` /
    /// `tcp://host:port` or a bare domain resolved through SRV. Endpoints are
    /// tried in order until one accepts the connection.
    pub async fn connect_domain(&self, server: &str) -> Result<(), EngineError> {
        let (endpoints, domain) = match parse_server_input(server) {
            ParsedServer::Direct(endpoint) => {
                let domain = endpoint.host.clone();
                (vec![endpoint], domain)
            }
            ParsedServer::Domain(domain) => (resolve_client_endpoints(&domain).await, domain),
        };

        let mut last_error = EngineError::Resolve(format!("no endpoint for {}", domain));
        for endpoint in endpoints {
            match self.connect(&endpoint.host, endpoint.port, &domain).await {
                Ok(()) => return Ok(()),
                Err(e @ EngineError::StateConflict { .. }) => return Err(e),
                Err(e) => {
                    warn!(host = %endpoint.host, port = endpoint.port, error = %e, "Endpoint failed, trying next");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Start authenticating. Fails immediately with a state conflict unless
    /// the client is connected and not already logging in.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        resource: Option<&str>,
    ) -> Result<PendingLogin, EngineError> {
        match self.current_session() {
            Some(session) => session.login(username, password, resource),
            None => Err(EngineError::StateConflict {
                current: self.state.get().name(),
                expected: vec![ConnectionState::Connected.name()],
            }),
        }
    }

    /// Queue a stanza on the current connection.
    pub fn send(&self, outbound: impl Into<Outbound>) -> Result<(), EngineError> {
        match self.current_session() {
            Some(session) if self.state.is_any(&ConnectionState::ACTIVE) => {
                session.outbox().send(outbound)
            }
            _ => Err(EngineError::ConnectionClosed),
        }
    }

    /// Close the stream and wait for the connection to end. Safe to call in
    /// any state and concurrently.
    pub async fn disconnect(&self) -> Result<(), EngineError> {
        match self.current_session() {
            Some(session) => session.disconnect().await,
            None => Ok(()),
        }
    }
}

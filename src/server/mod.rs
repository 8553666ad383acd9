//! XMPP server: accepts client streams over TCP (with optional STARTTLS) and
//! RFC 7395 WebSocket, and runs them through the installed modules.
//!
//! ```no_run
//! # async fn run() -> Result<(), xmpp_engine::EngineError> {
//! use xmpp_engine::server::{InMemoryAuthenticationService, XmppServer};
//!
//! let server = XmppServer::builder("example.org")
//!     .bind("127.0.0.1:5222")
//!     .authentication(InMemoryAuthenticationService::new().with_user("alice", "secret"))
//!     .build();
//! server.start().await?;
//! # server.stop().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod connection;
mod modules;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::rustls;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, warn};

pub use auth::{AuthenticationService, InMemoryAuthenticationService};
pub use connection::{ConnectionContext, Inbound, ServerConnection, TransportKind};
pub use modules::{
    iq_error, iq_result, BindModule, FeaturesModule, SaslModule, ServerModule, SessionModule,
    StartTlsModule,
};

use crate::connection::{
    next_connection_id, run_stream, run_websocket, tls, DriverConfig, Lifecycle, Outbox,
    StateCell, TlsUpgrade,
};
use crate::element::Element;
use crate::error::EngineError;
use crate::jid::Jid;
use crate::registry::{lock, Delivery, DispatchKey, DispatchRegistry, HandlerResult, Registration};
use crate::stream::codec::DEFAULT_MAX_STANZA_SIZE;
use connection::ServerConnectionHandler;

/// WebSocket sub-protocol for XMPP (RFC 7395).
const XMPP_SUBPROTOCOL: &str = "xmpp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub domain: String,
    pub bind_address: String,
    /// Also accept RFC 7395 WebSocket connections on this address.
    pub websocket_address: Option<String>,
    /// Refuse SASL over plain-text TCP streams.
    pub require_tls: bool,
    pub close_timeout_secs: u64,
    pub max_stanza_size: usize,
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            bind_address: "0.0.0.0:5222".to_string(),
            websocket_address: None,
            require_tls: false,
            close_timeout_secs: 5,
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            read_buffer_size: 8192,
        }
    }
}

impl ServerConfig {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            read_buffer_size: self.read_buffer_size,
            max_stanza_size: self.max_stanza_size,
            close_timeout: Duration::from_secs(self.close_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl Lifecycle for ServerState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Stopping => "Stopping",
        }
    }
}

/// State shared by every connection of a server: configuration, modules,
/// the dispatch registry and the connection indexes.
pub struct ServerContext {
    config: ServerConfig,
    registry: DispatchRegistry<Inbound>,
    modules: Vec<Arc<dyn ServerModule>>,
    connections: DashMap<u64, Arc<ServerConnection>>,
    routes: DashMap<Jid, Arc<ServerConnection>>,
    tls: TlsUpgrade,
    active: AtomicUsize,
}

impl ServerContext {
    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &DispatchRegistry<Inbound> {
        &self.registry
    }

    pub fn register<F>(&self, key: DispatchKey, handler: F) -> Registration
    where
        F: Fn(&Inbound) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry.register(key, handler)
    }

    pub fn require_tls(&self) -> bool {
        self.config.require_tls
    }

    pub fn tls_available(&self) -> bool {
        self.tls.is_available()
    }

    /// `<stream:features/>` children for a connection, in module order.
    pub fn features(&self, ctx: &ConnectionContext) -> Vec<Element> {
        self.modules
            .iter()
            .flat_map(|module| module.features(ctx))
            .collect()
    }

    /// Route `jid` to `connection` unless another connection already holds
    /// it. Returns whether the route was claimed.
    pub fn try_bind(&self, jid: Jid, connection: &Arc<ServerConnection>) -> bool {
        match self.routes.entry(jid) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(connection.clone());
                true
            }
        }
    }

    /// Connection bound to a full JID.
    pub fn connection(&self, jid: &Jid) -> Option<Arc<ServerConnection>> {
        self.routes.get(jid).map(|entry| entry.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    fn forget(&self, connection: &ServerConnection) {
        self.connections.remove(&connection.id());
        if let Some(jid) = connection.jid() {
            self.routes
                .remove_if(&jid, |_, bound| bound.id() == connection.id());
        }
    }
}

/// Removes a connection from the server indexes when its task ends, however
/// it ends.
struct ConnectionGuard {
    server: Arc<ServerContext>,
    connection: Arc<ServerConnection>,
}

impl ConnectionGuard {
    fn new(server: Arc<ServerContext>, connection: Arc<ServerConnection>) -> Self {
        server.active.fetch_add(1, Ordering::SeqCst);
        server
            .connections
            .insert(connection.id(), connection.clone());
        Self { server, connection }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.server.forget(&self.connection);
        let prev = self.server.active.fetch_sub(1, Ordering::SeqCst);
        debug!(conn_id = self.connection.id(), active = prev - 1, "Connection released");
    }
}

pub struct XmppServerBuilder {
    config: ServerConfig,
    tls: Option<Arc<rustls::ServerConfig>>,
    auth: Option<Arc<dyn AuthenticationService>>,
    modules: Vec<Arc<dyn ServerModule>>,
}

impl XmppServerBuilder {
    /// Replace the configuration. The domain given to `builder` is kept
    /// unless the new configuration names one.
    pub fn config(mut self, config: ServerConfig) -> Self {
        let domain = std::mem::take(&mut self.config.domain);
        self.config = config;
        if self.config.domain.is_empty() || self.config.domain == ServerConfig::default().domain {
            self.config.domain = domain;
        }
        self
    }

    pub fn bind(mut self, address: impl Into<String>) -> Self {
        self.config.bind_address = address.into();
        self
    }

    pub fn websocket(mut self, address: impl Into<String>) -> Self {
        self.config.websocket_address = Some(address.into());
        self
    }

    /// Enable STARTTLS with this certificate configuration.
    pub fn tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn require_tls(mut self, required: bool) -> Self {
        self.config.require_tls = required;
        self
    }

    pub fn authentication(mut self, auth: impl AuthenticationService + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Add an application module, installed after the built-in ones.
    pub fn module(mut self, module: impl ServerModule + 'static) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    pub fn build(self) -> XmppServer {
        let tls = match self.tls {
            Some(config) => {
                tls::init_crypto_provider();
                TlsUpgrade::server(config)
            }
            None => TlsUpgrade::Unavailable,
        };
        let auth = self.auth.unwrap_or_else(|| {
            warn!("No authentication service configured, every login will be refused");
            Arc::new(InMemoryAuthenticationService::new())
        });

        let mut modules: Vec<Arc<dyn ServerModule>> = vec![Arc::new(FeaturesModule)];
        if tls.is_available() {
            modules.push(Arc::new(StartTlsModule::new(self.config.require_tls)));
        }
        modules.push(Arc::new(SaslModule::new(auth)));
        modules.push(Arc::new(BindModule));
        modules.push(Arc::new(SessionModule));
        modules.extend(self.modules);

        XmppServer {
            context: Arc::new(ServerContext {
                config: self.config,
                registry: DispatchRegistry::new(),
                modules,
                connections: DashMap::new(),
                routes: DashMap::new(),
                tls,
                active: AtomicUsize::new(0),
            }),
            state: StateCell::new(ServerState::Stopped),
            running: Mutex::new(None),
        }
    }
}

struct Running {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
    websocket_addr: Option<SocketAddr>,
}

pub struct XmppServer {
    context: Arc<ServerContext>,
    state: StateCell<ServerState>,
    running: Mutex<Option<Running>>,
}

impl XmppServer {
    pub fn builder(domain: impl Into<String>) -> XmppServerBuilder {
        XmppServerBuilder {
            config: ServerConfig {
                domain: domain.into(),
                ..ServerConfig::default()
            },
            tls: None,
            auth: None,
            modules: Vec::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn registry(&self) -> &DispatchRegistry<Inbound> {
        self.context.registry()
    }

    /// Bound TCP address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().map(|r| r.local_addr)
    }

    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().and_then(|r| r.websocket_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.context.connection_count()
    }

    pub fn connection(&self, jid: &Jid) -> Option<Arc<ServerConnection>> {
        self.context.connection(jid)
    }

    /// Install the modules and start accepting connections.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.state
            .transition(ServerState::Starting, &[ServerState::Stopped])?;

        // Handlers must be in place before the first connection is accepted.
        for module in &self.context.modules {
            debug!(module = module.name(), "Installing module");
            module.install(&self.context);
        }
        let running = match self.listen().await {
            Ok(running) => running,
            Err(e) => {
                error!(error = %e, "Failed to start server");
                self.uninstall_modules();
                self.state.force(ServerState::Stopped);
                return Err(e);
            }
        };
        info!(
            domain = self.context.domain(),
            addr = %running.local_addr,
            websocket = ?running.websocket_addr,
            "Server started"
        );
        *lock(&self.running) = Some(running);
        self.state
            .transition(ServerState::Started, &[ServerState::Starting])?;
        Ok(())
    }

    async fn listen(&self) -> Result<Running, EngineError> {
        let (shutdown, _) = broadcast::channel(1);
        let listener = TcpListener::bind(self.context.config.bind_address.as_str()).await?;
        let local_addr = listener.local_addr()?;
        let mut tasks = vec![tokio::spawn(accept_loop(
            listener,
            self.context.clone(),
            shutdown.subscribe(),
            TransportKind::Tcp,
        ))];

        let mut websocket_addr = None;
        if let Some(address) = &self.context.config.websocket_address {
            let listener = match TcpListener::bind(address.as_str()).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = shutdown.send(());
                    return Err(e.into());
                }
            };
            websocket_addr = Some(listener.local_addr()?);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                self.context.clone(),
                shutdown.subscribe(),
                TransportKind::WebSocket,
            )));
        }

        Ok(Running {
            shutdown,
            tasks,
            local_addr,
            websocket_addr,
        })
    }

    /// Stop accepting, close every connection and uninstall the modules.
    /// Closing streams finish in the background.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.state
            .transition(ServerState::Stopping, &[ServerState::Started])?;

        let running = lock(&self.running).take();
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            for task in running.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Accept task ended abnormally");
                }
            }
        }

        for connection in self.context.connections() {
            connection.close();
        }
        self.uninstall_modules();

        self.state.force(ServerState::Stopped);
        info!(domain = self.context.domain(), "Server stopped");
        Ok(())
    }

    fn uninstall_modules(&self) {
        for module in self.context.modules.iter().rev() {
            debug!(module = module.name(), "Uninstalling module");
            module.uninstall(&self.context);
        }
        self.context.registry.unregister_all();
    }
}

async fn accept_loop(
    listener: TcpListener,
    server: Arc<ServerContext>,
    mut shutdown: broadcast::Receiver<()>,
    transport: TransportKind,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(peer = %peer, transport = ?transport, "New connection");
                    let server = server.clone();
                    tokio::spawn(async move {
                        match transport {
                            TransportKind::Tcp => serve_tcp(server, stream, peer).await,
                            TransportKind::WebSocket => serve_websocket(server, stream, peer).await,
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            _ = shutdown.recv() => {
                info!(transport = ?transport, "Shutting down listener");
                break;
            }
        }
    }
}

fn open_connection(
    server: &Arc<ServerContext>,
    peer: SocketAddr,
    transport: TransportKind,
) -> (
    ConnectionGuard,
    Arc<ServerConnectionHandler>,
    tokio::sync::mpsc::UnboundedReceiver<crate::connection::Command>,
) {
    let (outbox, commands) = Outbox::channel(next_connection_id());
    let connection = Arc::new(ServerConnection::new(peer, transport, outbox));
    let guard = ConnectionGuard::new(server.clone(), connection.clone());
    let handler = Arc::new(ServerConnectionHandler {
        server: server.clone(),
        connection,
    });
    handler.publish(Delivery::Connected);
    (guard, handler, commands)
}

async fn serve_tcp(server: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (guard, handler, commands) = open_connection(&server, peer, TransportKind::Tcp);
    let conn_id = guard.connection.id();
    run_stream(
        conn_id,
        Box::new(stream),
        commands,
        handler,
        server.tls.clone(),
        server.config.driver_config(),
    )
    .await;
}

async fn serve_websocket(server: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    let negotiate = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let offered = request
            .headers()
            .get_all("Sec-WebSocket-Protocol")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|protocol| protocol.trim() == XMPP_SUBPROTOCOL);
        if offered {
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(XMPP_SUBPROTOCOL),
            );
        }
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, negotiate).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (guard, handler, commands) = open_connection(&server, peer, TransportKind::WebSocket);
    let conn_id = guard.connection.id();
    run_websocket(conn_id, ws, commands, handler, server.config.driver_config()).await;
}

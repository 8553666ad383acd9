//! Client side of stream negotiation.
//!
//! A [`ClientSession`] is one connection's handshake: it reacts to
//! `stream:features`, STARTTLS, SASL and bind/session results delivered by
//! the registry, and resolves the single outstanding login continuation.
//! Every step re-checks the connection state and silently does nothing when
//! the connection already left the state it expects.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{ClientConfig, ClientModule, ClientModuleContext};
use crate::connection::{Command, ConnectionHandler, ConnectionState, Lifecycle, Outbox, StateCell};
use crate::element::Element;
use crate::error::EngineError;
use crate::jid::Jid;
use crate::registry::{lock, Delivery, DispatchKey, DispatchRegistry, RegistrationSet};
use crate::stream::{
    stream_open, StreamEvent, NS_BIND, NS_CLIENT, NS_SASL, NS_SESSION, NS_STREAMS, NS_TLS,
};

use ConnectionState::*;

/// Handshake steps run only in these states.
const NEGOTIATING: [ConnectionState; 2] = [LoggingIn, Securing];

const BIND_ID: &str = "bind";
const SESSION_ID: &str = "session";

type LoginResult = Result<Jid, EngineError>;

/// Resolves once the login started by [`XmppClient::login`](super::XmppClient::login)
/// succeeds or fails.
///
/// Dropping it does not cancel the handshake; bound it with
/// `tokio::time::timeout` and call `disconnect()` on expiry.
#[derive(Debug)]
pub struct PendingLogin {
    rx: oneshot::Receiver<LoginResult>,
}

impl Future for PendingLogin {
    type Output = LoginResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(EngineError::ConnectionClosed)))
    }
}

#[derive(Clone)]
struct Credentials {
    username: String,
    password: String,
    resource: Option<String>,
}

/// Guarded by one lock so `login` and the features handler agree on whether
/// features arrived before or after the login started.
#[derive(Default)]
struct LoginSlot {
    credentials: Option<Credentials>,
    pending: Option<oneshot::Sender<LoginResult>>,
    /// Features waiting for the next login.
    features: Option<Element>,
    /// Latest features of the current stream, replayed when a failed login
    /// is retried.
    offered: Option<Element>,
}

pub(crate) struct ClientSession {
    conn_id: u64,
    domain: String,
    require_tls: bool,
    tls_available: bool,
    state: Arc<StateCell<ConnectionState>>,
    registry: Arc<DispatchRegistry<Delivery>>,
    outbox: Outbox,
    handshake: RegistrationSet,
    login: Mutex<LoginSlot>,
    secured: AtomicBool,
    jid: Mutex<Option<Jid>>,
    modules: Vec<Arc<dyn ClientModule>>,
    module_context: ClientModuleContext,
    started: AtomicBool,
    torn_down: AtomicBool,
    closed: watch::Sender<bool>,
}

impl ClientSession {
    pub(crate) fn new(
        domain: &str,
        config: &ClientConfig,
        tls_available: bool,
        state: Arc<StateCell<ConnectionState>>,
        registry: Arc<DispatchRegistry<Delivery>>,
        outbox: Outbox,
        modules: Vec<Arc<dyn ClientModule>>,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            conn_id: outbox.conn_id(),
            domain: domain.to_string(),
            require_tls: config.require_tls,
            tls_available,
            state,
            module_context: ClientModuleContext::new(registry.clone(), outbox.clone()),
            registry,
            outbox,
            handshake: RegistrationSet::new(),
            login: Mutex::new(LoginSlot::default()),
            secured: AtomicBool::new(false),
            jid: Mutex::new(None),
            modules,
            started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            closed,
        })
    }

    pub(crate) fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub(crate) fn jid(&self) -> Option<Jid> {
        lock(&self.jid).clone()
    }

    pub(crate) fn is_secured(&self) -> bool {
        self.secured.load(Ordering::SeqCst)
    }

    /// Register the handshake handlers, install the modules and announce the
    /// connection. Called once the transport is up.
    pub(crate) fn start(self: &Arc<Self>) {
        self.on_stanza(DispatchKey::stanza("stream:features", NS_STREAMS), Self::on_features);
        self.on_stanza(DispatchKey::stanza("proceed", NS_TLS), Self::on_proceed);
        self.on_stanza(DispatchKey::stanza("failure", NS_TLS), Self::on_starttls_failure);
        self.on_stanza(DispatchKey::stanza("success", NS_SASL), Self::on_sasl_success);
        self.on_stanza(DispatchKey::stanza("failure", NS_SASL), Self::on_sasl_failure);
        self.on_stanza(DispatchKey::stanza("iq", NS_CLIENT), Self::on_iq);

        let session = Arc::downgrade(self);
        self.handshake.push(self.registry.register(DispatchKey::stream_end(), move |_| {
            if let Some(session) = session.upgrade() {
                if !session.state.is_any(&[Disconnecting, Disconnected]) {
                    info!(conn_id = session.conn_id, "Server closed the stream");
                    session.outbox.close()?;
                }
            }
            Ok(())
        }));

        for module in &self.modules {
            debug!(conn_id = self.conn_id, module = module.name(), "Installing module");
            module.install(&self.module_context);
        }
        self.started.store(true, Ordering::SeqCst);
        self.registry
            .publish(&DispatchKey::connected(), &Delivery::Connected);
    }

    fn on_stanza(
        self: &Arc<Self>,
        key: DispatchKey,
        step: fn(&ClientSession, &Element) -> Result<(), EngineError>,
    ) {
        let session = Arc::downgrade(self);
        let registration = self.registry.register(key, move |delivery: &Delivery| {
            if let (Some(session), Some(stanza)) = (session.upgrade(), delivery.stanza()) {
                let result = step(&session, stanza);
                session.finish_step(result);
            }
            Ok(())
        });
        self.handshake.push(registration);
    }

    fn finish_step(&self, result: Result<(), EngineError>) {
        if let Err(e) = result {
            warn!(conn_id = self.conn_id, error = %e, "Login failed");
            self.fail(e);
        }
    }

    /// Resolve the login with a handshake failure. When the stream is still
    /// usable the connection goes back to `Connected` so the caller may retry
    /// the login or disconnect. A failed TLS upgrade stays in `Securing`.
    fn fail(&self, error: EngineError) {
        let pending = {
            let mut slot = lock(&self.login);
            let Some(pending) = slot.pending.take() else {
                return;
            };
            slot.credentials = None;
            let usable: &[ConnectionState] = if self.is_secured() {
                &NEGOTIATING
            } else {
                &[LoggingIn]
            };
            if self.state.transition(Connected, usable).is_ok() {
                slot.features = slot.offered.clone();
            }
            pending
        };
        let _ = pending.send(Err(error));
    }

    /// Deliver the login outcome. Later calls are no-ops.
    fn resolve(&self, result: LoginResult) {
        let pending = {
            let mut slot = lock(&self.login);
            slot.credentials = None;
            slot.pending.take()
        };
        if let Some(pending) = pending {
            let _ = pending.send(result);
        }
    }

    /// True while a login is outstanding and negotiation may advance.
    fn negotiating(&self) -> bool {
        self.state.is_any(&NEGOTIATING) && lock(&self.login).pending.is_some()
    }

    /// Start the login. Features that arrived before this call are processed
    /// immediately, later ones by the features handler.
    pub(crate) fn login(
        &self,
        username: &str,
        password: &str,
        resource: Option<&str>,
    ) -> Result<PendingLogin, EngineError> {
        let (tx, rx) = oneshot::channel();
        let features = {
            let mut slot = lock(&self.login);
            self.state.transition(LoggingIn, &[Connected])?;
            slot.credentials = Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
                resource: resource.map(str::to_string),
            });
            slot.pending = Some(tx);
            slot.features.take()
        };
        info!(conn_id = self.conn_id, username, "Logging in");

        if let Some(features) = features {
            let result = self.negotiate(&features);
            self.finish_step(result);
        }
        Ok(PendingLogin { rx })
    }

    // --- handshake steps ---

    fn on_features(&self, features: &Element) -> Result<(), EngineError> {
        {
            let mut slot = lock(&self.login);
            slot.offered = Some(features.clone());
            match self.state.get() {
                Connected => {
                    debug!(conn_id = self.conn_id, "Features received before login, keeping them");
                    slot.features = Some(features.clone());
                    return Ok(());
                }
                LoggingIn | Securing if slot.pending.is_some() => {}
                _ => return Ok(()),
            }
        }
        self.negotiate(features)
    }

    fn negotiate(&self, features: &Element) -> Result<(), EngineError> {
        let starttls = features.child("starttls", NS_TLS);
        let tls_required = self.require_tls
            || starttls.is_some_and(|s| s.has_child("required", NS_TLS));

        if tls_required && !self.is_secured() {
            if starttls.is_none() {
                return Err(EngineError::protocol(
                    "TLS is required but the server does not offer STARTTLS",
                    Some(features),
                ));
            }
            if !self.tls_available {
                return Err(EngineError::Tls(
                    "TLS is required but no TLS configuration is available".to_string(),
                ));
            }
            info!(conn_id = self.conn_id, "Requesting STARTTLS");
            return self.outbox.send(Element::new_ns("starttls", NS_TLS));
        }

        self.authenticate(features)
    }

    fn authenticate(&self, features: &Element) -> Result<(), EngineError> {
        if let Some(mechanisms) = features.child("mechanisms", NS_SASL) {
            let plain = mechanisms
                .children()
                .any(|m| m.local_name() == "mechanism" && m.text().trim() == "PLAIN");
            if !plain {
                return Err(EngineError::auth(
                    "server does not offer SASL PLAIN",
                    Some(features),
                ));
            }
        }

        let credentials = lock(&self.login)
            .credentials
            .clone()
            .ok_or(EngineError::ConnectionClosed)?;
        let token = STANDARD.encode(format!(
            "\0{}\0{}",
            credentials.username, credentials.password
        ));
        debug!(conn_id = self.conn_id, "Sending SASL PLAIN");
        self.outbox.send(
            Element::new_ns("auth", NS_SASL)
                .with_attr("mechanism", "PLAIN")
                .with_text(token),
        )
    }

    fn on_proceed(&self, _proceed: &Element) -> Result<(), EngineError> {
        if !self.negotiating() {
            return Ok(());
        }
        if self.state.transition(Securing, &[LoggingIn]).is_err() {
            return Ok(());
        }
        info!(conn_id = self.conn_id, "Server accepted STARTTLS, upgrading");
        self.outbox.command(Command::StartTls)
    }

    fn on_starttls_failure(&self, failure: &Element) -> Result<(), EngineError> {
        if !self.negotiating() {
            return Ok(());
        }
        Err(EngineError::auth("server refused STARTTLS", Some(failure)))
    }

    fn on_sasl_success(&self, _success: &Element) -> Result<(), EngineError> {
        if !self.negotiating() {
            return Ok(());
        }
        info!(conn_id = self.conn_id, "SASL authentication succeeded, binding resource");
        let resource = lock(&self.login)
            .credentials
            .as_ref()
            .and_then(|c| c.resource.clone());

        let mut bind = Element::new_ns("bind", NS_BIND);
        if let Some(resource) = resource {
            bind.append_child(Element::new_ns("resource", NS_BIND).with_text(resource));
        }
        self.outbox.send(
            Element::new("iq")
                .with_attr("type", "set")
                .with_attr("id", BIND_ID)
                .with_child(bind),
        )
    }

    fn on_sasl_failure(&self, failure: &Element) -> Result<(), EngineError> {
        if !self.negotiating() {
            return Ok(());
        }
        let condition = failure
            .children()
            .find(|c| c.local_name() != "text")
            .map_or("failure", |c| c.local_name());
        Err(EngineError::auth(condition, Some(failure)))
    }

    fn on_iq(&self, iq: &Element) -> Result<(), EngineError> {
        match iq.attr("id") {
            Some(BIND_ID) => self.on_bind_result(iq),
            Some(SESSION_ID) => self.on_session_result(iq),
            _ => Ok(()),
        }
    }

    fn on_bind_result(&self, iq: &Element) -> Result<(), EngineError> {
        if !self.negotiating() {
            return Ok(());
        }
        if iq.attr("type") != Some("result") {
            return Err(EngineError::protocol("resource binding failed", Some(iq)));
        }
        let jid: Jid = iq
            .child("bind", NS_BIND)
            .and_then(|bind| bind.child_text("jid", NS_BIND))
            .ok_or_else(|| EngineError::protocol("bind result carries no JID", Some(iq)))?
            .trim()
            .parse()
            .map_err(|e| EngineError::protocol(format!("invalid bound JID: {}", e), Some(iq)))?;
        info!(conn_id = self.conn_id, jid = %jid, "Resource bound, starting session");
        *lock(&self.jid) = Some(jid);

        self.outbox.send(
            Element::new("iq")
                .with_attr("to", self.domain.as_str())
                .with_attr("type", "set")
                .with_attr("id", SESSION_ID)
                .with_child(Element::new_ns("session", NS_SESSION)),
        )
    }

    fn on_session_result(&self, iq: &Element) -> Result<(), EngineError> {
        if !self.negotiating() {
            return Ok(());
        }
        if iq.attr("type") != Some("result") {
            return Err(EngineError::protocol("session establishment failed", Some(iq)));
        }
        let jid = self
            .jid()
            .ok_or_else(|| EngineError::protocol("session established before bind", Some(iq)))?;
        if self.state.transition(LoggedIn, &NEGOTIATING).is_err() {
            return Ok(());
        }
        info!(conn_id = self.conn_id, jid = %jid, "Logged in");
        self.resolve(Ok(jid));
        Ok(())
    }

    // --- teardown ---

    /// Close the stream and wait until the connection is gone. Concurrent
    /// callers all wait on the same teardown.
    pub(crate) async fn disconnect(&self) -> Result<(), EngineError> {
        let mut closed = self.closed.subscribe();
        match self.state.transition(Disconnecting, &ConnectionState::ACTIVE) {
            Ok(previous) => {
                info!(conn_id = self.conn_id, from = previous.name(), "Disconnecting");
                self.handshake.cancel_all(&self.registry);
                self.resolve(Err(EngineError::ConnectionClosed));
                if self.outbox.close().is_err() {
                    self.on_closed(None);
                }
            }
            Err(_) if self.state.is(Disconnected) => return Ok(()),
            Err(_) => debug!(conn_id = self.conn_id, "Disconnect already in progress"),
        }
        let _ = closed.wait_for(|closed| *closed).await;
        Ok(())
    }
}

impl ConnectionHandler for ClientSession {
    fn on_event(&self, event: StreamEvent) {
        if let StreamEvent::StreamStart(header) = &event {
            debug!(conn_id = self.conn_id, id = ?header.id(), from = ?header.from(), "Stream opened");
        }
        let delivery = Delivery::Stream(event);
        for key in delivery.keys() {
            self.registry.publish(&key, &delivery);
        }
    }

    fn on_tls(&self, result: Result<(), EngineError>) {
        if !self.state.is(Securing) {
            debug!(conn_id = self.conn_id, "Ignoring TLS result outside of Securing");
            return;
        }
        match result {
            Ok(()) => {
                self.secured.store(true, Ordering::SeqCst);
                let reopen = self
                    .outbox
                    .send(stream_open(None, Some(&self.domain), None));
                self.finish_step(reopen);
            }
            Err(e) => self.finish_step(Err(EngineError::auth(
                format!("TLS upgrade failed: {}", e),
                None,
            ))),
        }
    }

    fn on_closed(&self, cause: Option<EngineError>) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let previous = self.state.force(Disconnected);
        self.handshake.cancel_all(&self.registry);
        match &cause {
            Some(e) => warn!(conn_id = self.conn_id, error = %e, from = previous.name(), "Connection lost"),
            None => info!(conn_id = self.conn_id, "Disconnected"),
        }
        self.resolve(Err(cause.unwrap_or(EngineError::ConnectionClosed)));

        if self.started.load(Ordering::SeqCst) {
            self.registry
                .publish(&DispatchKey::disconnected(), &Delivery::Disconnected);
            for module in &self.modules {
                debug!(conn_id = self.conn_id, module = module.name(), "Uninstalling module");
                module.uninstall(&self.module_context);
            }
            self.module_context.release();
        }
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::next_connection_id;
    use crate::stream::{Outbound, StanzaCodec};
    use tokio::sync::mpsc::UnboundedReceiver;

    const FEATURES_PLAIN: &str = "<stream:features>\
        <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
        </stream:features>";
    const FEATURES_STARTTLS_REQUIRED: &str = "<stream:features>\
        <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
        <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
        </stream:features>";
    const SUCCESS: &str = "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>";
    const BIND_RESULT: &str = "<iq type='result' id='bind'>\
        <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.org/desk</jid></bind></iq>";
    const SESSION_RESULT: &str = "<iq type='result' id='session'/>";

    struct Harness {
        session: Arc<ClientSession>,
        state: Arc<StateCell<ConnectionState>>,
        commands: UnboundedReceiver<Command>,
    }

    impl Harness {
        fn new(tls_available: bool) -> Self {
            let state = Arc::new(StateCell::new(Disconnected));
            let (outbox, commands) = Outbox::channel(next_connection_id());
            let session = ClientSession::new(
                "example.org",
                &ClientConfig::default(),
                tls_available,
                state.clone(),
                Arc::new(DispatchRegistry::new()),
                outbox,
                Vec::new(),
            );
            state.transition(Connecting, &[Disconnected]).expect("connecting");
            state.transition(Connected, &[Connecting]).expect("connected");
            session.start();
            Self {
                session,
                state,
                commands,
            }
        }

        /// Decode `xml` as a stanza inside a client stream and deliver it.
        fn receive(&self, xml: &str) {
            let mut codec = StanzaCodec::new();
            let input = format!("{}{}", stream_open(Some("example.org"), None, Some("s1")), xml);
            for event in codec.feed(input.as_bytes()).expect("valid stanza") {
                if let StreamEvent::Stanza(_) = event {
                    self.session.on_event(event);
                }
            }
        }

        /// Everything queued for the driver since the last call.
        fn sent(&mut self) -> Vec<String> {
            let mut sent = Vec::new();
            while let Ok(command) = self.commands.try_recv() {
                sent.push(match command {
                    Command::Send(Outbound::Element(element)) => element.to_xml().expect("serialize"),
                    Command::Send(Outbound::Raw(raw)) => raw,
                    Command::Send(Outbound::Bytes(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Command::StartTls => "STARTTLS".to_string(),
                    Command::Close => "CLOSE".to_string(),
                });
            }
            sent
        }
    }

    // --- happy path ---

    #[tokio::test]
    async fn test_happy_path_reaches_logged_in() {
        let mut h = Harness::new(false);
        let pending = h.session.login("alice", "secret", Some("desk")).expect("login");
        assert_eq!(h.state.get(), LoggingIn);

        h.receive(FEATURES_PLAIN);
        assert_eq!(
            h.sent(),
            vec![r#"<auth xmlns="urn:ietf:params:xml:ns:xmpp-sasl" mechanism="PLAIN">AGFsaWNlAHNlY3JldA==</auth>"#]
        );

        h.receive(SUCCESS);
        assert_eq!(
            h.sent(),
            vec![r#"<iq type="set" id="bind"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"><resource>desk</resource></bind></iq>"#]
        );

        h.receive(BIND_RESULT);
        assert_eq!(
            h.sent(),
            vec![r#"<iq to="example.org" type="set" id="session"><session xmlns="urn:ietf:params:xml:ns:xmpp-session"/></iq>"#]
        );
        assert_eq!(h.state.get(), LoggingIn);

        h.receive(SESSION_RESULT);
        assert_eq!(h.state.get(), LoggedIn);
        let jid = pending.await.expect("logged in");
        assert_eq!(jid.to_string(), "alice@example.org/desk");

        // A duplicate result changes nothing.
        h.receive(SESSION_RESULT);
        assert_eq!(h.state.get(), LoggedIn);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_features_before_login_are_replayed() {
        let mut h = Harness::new(false);
        h.receive(FEATURES_PLAIN);
        assert!(h.sent().is_empty());
        assert_eq!(h.state.get(), Connected);

        let _pending = h.session.login("alice", "secret", None).expect("login");
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("<auth "));

        h.receive(SUCCESS);
        assert_eq!(
            h.sent(),
            vec![r#"<iq type="set" id="bind"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"/></iq>"#]
        );
    }

    // --- STARTTLS ---

    #[tokio::test]
    async fn test_tls_required_path_passes_through_securing() {
        let mut h = Harness::new(true);
        let pending = h.session.login("alice", "secret", Some("desk")).expect("login");

        h.receive(FEATURES_STARTTLS_REQUIRED);
        assert_eq!(h.sent(), vec![r#"<starttls xmlns="urn:ietf:params:xml:ns:xmpp-tls"/>"#]);
        assert_eq!(h.state.get(), LoggingIn);

        h.receive("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert_eq!(h.state.get(), Securing);
        assert_eq!(h.sent(), vec!["STARTTLS"]);

        h.session.on_tls(Ok(()));
        assert!(h.session.is_secured());
        let reopen = h.sent();
        assert_eq!(reopen.len(), 1);
        assert!(reopen[0].contains("to='example.org'"));

        h.receive(FEATURES_PLAIN);
        assert!(h.sent()[0].starts_with("<auth "));
        h.receive(SUCCESS);
        h.receive(BIND_RESULT);
        h.receive(SESSION_RESULT);
        assert_eq!(h.state.get(), LoggedIn);
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn test_tls_failure_halts_in_securing() {
        let mut h = Harness::new(true);
        let pending = h.session.login("alice", "secret", None).expect("login");
        h.receive(FEATURES_STARTTLS_REQUIRED);
        h.receive("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        h.sent();

        h.session.on_tls(Err(EngineError::Tls("handshake failed".to_string())));
        assert!(matches!(pending.await, Err(EngineError::Auth { .. })));
        assert_eq!(h.state.get(), Securing);

        // No further advancement.
        h.receive(FEATURES_PLAIN);
        h.receive(SUCCESS);
        assert!(h.sent().is_empty());
        assert_eq!(h.state.get(), Securing);
    }

    #[tokio::test]
    async fn test_tls_required_without_configuration_fails() {
        let mut h = Harness::new(false);
        let pending = h.session.login("alice", "secret", None).expect("login");
        h.receive(FEATURES_STARTTLS_REQUIRED);
        assert!(matches!(pending.await, Err(EngineError::Tls(_))));
        assert!(h.sent().is_empty());
    }

    // --- failures ---

    #[tokio::test]
    async fn test_sasl_failure_carries_stanza() {
        let h = Harness::new(false);
        let pending = h.session.login("alice", "wrong", None).expect("login");
        h.receive(FEATURES_PLAIN);
        h.receive("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>");

        match pending.await {
            Err(EngineError::Auth { reason, stanza }) => {
                assert_eq!(reason, "not-authorized");
                assert!(stanza.expect("stanza").has_child("not-authorized", NS_SASL));
            }
            other => panic!("unexpected login result {:?}", other),
        }
        assert_eq!(h.state.get(), Connected);
    }

    #[tokio::test]
    async fn test_login_can_be_retried_after_sasl_failure() {
        let mut h = Harness::new(false);
        let pending = h.session.login("alice", "wrong", None).expect("login");
        h.receive(FEATURES_PLAIN);
        h.receive("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>");
        assert!(matches!(pending.await, Err(EngineError::Auth { .. })));
        assert_eq!(h.state.get(), Connected);
        h.sent();

        // The server does not repeat its features; the retry reuses them.
        let pending = h.session.login("alice", "secret", Some("desk")).expect("retry");
        assert_eq!(
            h.sent(),
            vec![r#"<auth xmlns="urn:ietf:params:xml:ns:xmpp-sasl" mechanism="PLAIN">AGFsaWNlAHNlY3JldA==</auth>"#]
        );
        h.receive(SUCCESS);
        h.receive(BIND_RESULT);
        h.receive(SESSION_RESULT);
        assert_eq!(h.state.get(), LoggedIn);
        assert_eq!(pending.await.expect("logged in").to_string(), "alice@example.org/desk");
    }

    #[tokio::test]
    async fn test_sasl_failure_after_tls_returns_to_connected() {
        let mut h = Harness::new(true);
        let pending = h.session.login("alice", "wrong", None).expect("login");
        h.receive(FEATURES_STARTTLS_REQUIRED);
        h.receive("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        h.session.on_tls(Ok(()));
        h.receive(FEATURES_PLAIN);
        h.receive("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>");
        assert!(matches!(pending.await, Err(EngineError::Auth { .. })));
        assert_eq!(h.state.get(), Connected);
        h.sent();

        // The retry does not negotiate STARTTLS a second time.
        let _pending = h.session.login("alice", "secret", None).expect("retry");
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("<auth "));
    }

    #[tokio::test]
    async fn test_bind_error_is_protocol_failure() {
        let h = Harness::new(false);
        let pending = h.session.login("alice", "secret", None).expect("login");
        h.receive(FEATURES_PLAIN);
        h.receive(SUCCESS);
        h.receive("<iq type='error' id='bind'><error type='cancel'/></iq>");

        assert!(matches!(pending.await, Err(EngineError::Protocol { .. })));
        assert_eq!(h.state.get(), Connected);

        // Late stanzas for the abandoned attempt are ignored.
        h.receive(SESSION_RESULT);
        assert_eq!(h.state.get(), Connected);
    }

    #[tokio::test]
    async fn test_missing_plain_mechanism_fails() {
        let h = Harness::new(false);
        let pending = h.session.login("alice", "secret", None).expect("login");
        h.receive(
            "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>SCRAM-SHA-1</mechanism></mechanisms></stream:features>",
        );
        assert!(matches!(pending.await, Err(EngineError::Auth { .. })));
        assert_eq!(h.state.get(), Connected);
    }

    // --- state guards ---

    #[test]
    fn test_login_before_connect_is_state_conflict() {
        let state = Arc::new(StateCell::new(Disconnected));
        let (outbox, _commands) = Outbox::channel(next_connection_id());
        let session = ClientSession::new(
            "example.org",
            &ClientConfig::default(),
            false,
            state.clone(),
            Arc::new(DispatchRegistry::new()),
            outbox,
            Vec::new(),
        );
        assert!(matches!(
            session.login("alice", "secret", None),
            Err(EngineError::StateConflict { current: "Disconnected", .. })
        ));
        assert_eq!(state.get(), Disconnected);
    }

    #[tokio::test]
    async fn test_second_login_is_rejected() {
        let h = Harness::new(false);
        let _pending = h.session.login("alice", "secret", None).expect("login");
        assert!(matches!(
            h.session.login("alice", "secret", None),
            Err(EngineError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_end_from_server_closes() {
        let mut h = Harness::new(false);
        h.session.on_event(StreamEvent::StreamEnd);
        assert_eq!(h.sent(), vec!["CLOSE"]);
    }

    #[tokio::test]
    async fn test_concurrent_disconnects_share_teardown() {
        let mut h = Harness::new(false);
        let pending = h.session.login("alice", "secret", None).expect("login");

        let first = tokio::spawn({
            let session = h.session.clone();
            async move { session.disconnect().await }
        });
        let second = tokio::spawn({
            let session = h.session.clone();
            async move { session.disconnect().await }
        });
        // Wait for the close command, then play the driver's part.
        while !h.sent().contains(&"CLOSE".to_string()) {
            tokio::task::yield_now().await;
        }
        h.session.on_closed(None);

        first.await.expect("join").expect("disconnect");
        second.await.expect("join").expect("disconnect");
        assert_eq!(h.state.get(), Disconnected);
        assert!(matches!(pending.await, Err(EngineError::ConnectionClosed)));
        assert!(h.session.disconnect().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_racing_login_stays_consistent() {
        for _ in 0..50 {
            let mut h = Harness::new(false);
            let login = tokio::task::spawn_blocking({
                let session = h.session.clone();
                move || session.login("alice", "secret", None)
            });
            let disconnect = tokio::spawn({
                let session = h.session.clone();
                async move { session.disconnect().await }
            });
            while !h.sent().contains(&"CLOSE".to_string()) {
                tokio::task::yield_now().await;
            }

            // Either the login started first and is cancelled by the
            // disconnect, or it lost the race and left the state alone.
            match login.await.expect("join") {
                Ok(pending) => {
                    assert!(matches!(pending.await, Err(EngineError::ConnectionClosed)));
                }
                Err(EngineError::StateConflict { current, .. }) => {
                    assert_eq!(current, "Disconnecting");
                }
                Err(other) => panic!("unexpected login error {:?}", other),
            }
            assert_eq!(h.state.get(), Disconnecting);

            h.session.on_closed(None);
            disconnect.await.expect("join").expect("disconnect");
            assert_eq!(h.state.get(), Disconnected);
        }
    }

    #[tokio::test]
    async fn test_transport_loss_resolves_login_with_cause() {
        let h = Harness::new(false);
        let pending = h.session.login("alice", "secret", None).expect("login");
        h.session.on_closed(Some(EngineError::Transport(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        ))));
        assert!(matches!(pending.await, Err(EngineError::Transport(_))));
        assert_eq!(h.state.get(), Disconnected);
    }
}

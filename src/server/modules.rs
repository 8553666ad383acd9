//! Server modules: the capability interface and the built-in handshake
//! modules (stream features, STARTTLS, SASL PLAIN, resource binding and
//! session establishment).

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use super::auth::AuthenticationService;
use super::connection::{ConnectionContext, Inbound, TransportKind};
use super::ServerContext;
use crate::connection::ConnectionState;
use crate::element::Element;
use crate::jid::Jid;
use crate::registry::{Delivery, DispatchKey, HandlerResult};
use crate::stream::{
    stream_open, StreamEvent, NS_BIND, NS_CLIENT, NS_SASL, NS_SESSION, NS_STANZAS, NS_STREAMS,
    NS_TLS,
};

/// A unit of server functionality. Modules are installed in a fixed order
/// when the server starts and uninstalled when it stops.
pub trait ServerModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn install(&self, server: &ServerContext);

    fn uninstall(&self, _server: &ServerContext) {}

    /// Elements this module contributes to `<stream:features/>` for a
    /// connection in the given state.
    fn features(&self, _ctx: &ConnectionContext) -> Vec<Element> {
        Vec::new()
    }
}

pub(crate) fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Result reply to `iq`, echoing its id.
pub fn iq_result(iq: &Element) -> Element {
    let mut reply = Element::new("iq").with_attr("type", "result");
    if let Some(id) = iq.attr("id") {
        reply.set_attr("id", id);
    }
    reply
}

/// Error reply to `iq` carrying a stanza error condition.
pub fn iq_error(iq: &Element, error_type: &str, condition: &str) -> Element {
    let mut reply = Element::new("iq").with_attr("type", "error");
    if let Some(id) = iq.attr("id") {
        reply.set_attr("id", id);
    }
    reply.with_child(
        Element::new("error")
            .with_attr("type", error_type)
            .with_child(Element::new_ns(condition, NS_STANZAS)),
    )
}

fn is_set_with(iq: &Element, child: &str, ns: &str) -> bool {
    iq.attr("type") == Some("set") && iq.has_child(child, ns)
}

// --- stream features ---

/// Answers the stream header with our own and the aggregated features, and
/// answers the peer's stream close with ours.
pub struct FeaturesModule;

impl ServerModule for FeaturesModule {
    fn name(&self) -> &'static str {
        "features"
    }

    fn install(&self, server: &ServerContext) {
        server.register(DispatchKey::stream_start(), |inbound: &Inbound| -> HandlerResult {
            let Delivery::Stream(StreamEvent::StreamStart(header)) = &inbound.delivery else {
                return Ok(());
            };
            let server = &inbound.server;
            let connection = &inbound.connection;
            if let Some(to) = header.to() {
                if to != server.domain() {
                    warn!(conn_id = connection.id(), to, domain = server.domain(), "Stream addressed to another domain");
                }
            }

            let stream_id = random_id(16);
            let ctx = connection.update_context(|ctx| {
                ctx.stream_id = Some(stream_id.clone());
                ctx.clone()
            });
            debug!(conn_id = connection.id(), stream_id = %stream_id, "Stream opened");

            connection.send(stream_open(Some(server.domain()), header.from(), Some(&stream_id)))?;
            let mut features = Element::new_ns("stream:features", NS_STREAMS);
            for feature in server.features(&ctx) {
                features.append_child(feature);
            }
            connection.send(features)?;
            Ok(())
        });

        server.register(DispatchKey::stream_end(), |inbound: &Inbound| -> HandlerResult {
            debug!(conn_id = inbound.connection.id(), "Client closed the stream");
            inbound.connection.close();
            Ok(())
        });
    }
}

// --- STARTTLS ---

pub struct StartTlsModule {
    required: bool,
}

impl StartTlsModule {
    pub fn new(required: bool) -> Self {
        Self { required }
    }
}

impl ServerModule for StartTlsModule {
    fn name(&self) -> &'static str {
        "starttls"
    }

    fn install(&self, server: &ServerContext) {
        server.register(DispatchKey::stanza("starttls", NS_TLS), |inbound: &Inbound| -> HandlerResult {
            let connection = &inbound.connection;
            let ctx = connection.context();
            if ctx.transport != TransportKind::Tcp || ctx.secured || ctx.authenticated {
                warn!(conn_id = connection.id(), "Refusing STARTTLS");
                connection.send(Element::new_ns("failure", NS_TLS))?;
                connection.close();
                return Ok(());
            }
            connection.send(Element::new_ns("proceed", NS_TLS))?;
            connection.start_tls()?;
            Ok(())
        });
    }

    fn features(&self, ctx: &ConnectionContext) -> Vec<Element> {
        if ctx.transport != TransportKind::Tcp || ctx.secured || ctx.authenticated {
            return Vec::new();
        }
        let mut starttls = Element::new_ns("starttls", NS_TLS);
        if self.required {
            starttls.append_child(Element::new_ns("required", NS_TLS));
        }
        vec![starttls]
    }
}

// --- SASL ---

pub struct SaslModule {
    auth: Arc<dyn AuthenticationService>,
}

impl SaslModule {
    pub fn new(auth: Arc<dyn AuthenticationService>) -> Self {
        Self { auth }
    }
}

fn sasl_failure(condition: &str) -> Element {
    Element::new_ns("failure", NS_SASL).with_child(Element::new_ns(condition, NS_SASL))
}

/// Split a PLAIN message (`authzid \0 authcid \0 passwd`).
fn decode_plain(payload: &str) -> Result<(String, String), &'static str> {
    let payload = payload.trim();
    let bytes = STANDARD
        .decode(payload)
        .map_err(|_| "incorrect-encoding")?;
    let text = String::from_utf8(bytes).map_err(|_| "malformed-request")?;
    let mut parts = text.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(username), Some(password), None) if !username.is_empty() => {
            Ok((username.to_string(), password.to_string()))
        }
        _ => Err("malformed-request"),
    }
}

impl ServerModule for SaslModule {
    fn name(&self) -> &'static str {
        "sasl"
    }

    fn install(&self, server: &ServerContext) {
        let auth = self.auth.clone();
        server.register(DispatchKey::stanza("auth", NS_SASL), move |inbound: &Inbound| -> HandlerResult {
            let Some(request) = inbound.stanza() else {
                return Ok(());
            };
            let server = &inbound.server;
            let connection = &inbound.connection;
            let ctx = connection.context();

            let outcome = if ctx.authenticated {
                Err("malformed-request")
            } else if server.require_tls() && ctx.transport == TransportKind::Tcp && !ctx.secured {
                Err("encryption-required")
            } else if request.attr("mechanism") != Some("PLAIN") {
                Err("invalid-mechanism")
            } else {
                decode_plain(&request.text()).and_then(|(username, password)| {
                    if !auth.authenticate(&username, &password) {
                        return Err("not-authorized");
                    }
                    Jid::new(Some(&username), server.domain(), None).map_err(|_| "malformed-request")
                })
            };

            match outcome {
                Ok(jid) => {
                    info!(conn_id = connection.id(), jid = %jid, "Client authenticated");
                    connection.update_context(|ctx| {
                        ctx.authenticated = true;
                        ctx.jid = Some(jid);
                    });
                    if let Err(e) = connection
                        .state()
                        .transition(ConnectionState::LoggingIn, &[ConnectionState::Connected])
                    {
                        debug!(conn_id = connection.id(), error = %e, "State unchanged after authentication");
                    }
                    connection.send(Element::new_ns("success", NS_SASL))?;
                }
                Err(condition) => {
                    info!(conn_id = connection.id(), condition, "SASL authentication failed");
                    connection.send(sasl_failure(condition))?;
                }
            }
            Ok(())
        });
    }

    fn features(&self, ctx: &ConnectionContext) -> Vec<Element> {
        if ctx.authenticated {
            return Vec::new();
        }
        vec![Element::new_ns("mechanisms", NS_SASL)
            .with_child(Element::new_ns("mechanism", NS_SASL).with_text("PLAIN"))]
    }
}

// --- resource binding ---

pub struct BindModule;

impl ServerModule for BindModule {
    fn name(&self) -> &'static str {
        "bind"
    }

    fn install(&self, server: &ServerContext) {
        server.register(DispatchKey::stanza("iq", NS_CLIENT), |inbound: &Inbound| -> HandlerResult {
            let Some(iq) = inbound.stanza().filter(|iq| is_set_with(iq, "bind", NS_BIND)) else {
                return Ok(());
            };
            let server = &inbound.server;
            let connection = &inbound.connection;
            let ctx = connection.context();

            let bare = match (&ctx.jid, ctx.authenticated) {
                (Some(jid), true) if jid.is_bare() => jid.clone(),
                _ => {
                    connection.send(iq_error(iq, "auth", "not-authorized"))?;
                    return Ok(());
                }
            };

            let requested = iq
                .child("bind", NS_BIND)
                .and_then(|bind| bind.child_text("resource", NS_BIND))
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty());
            let mut full = match requested.as_deref().map(|r| bare.with_resource(r)) {
                Some(Ok(full)) => full,
                // Missing or invalid: the server picks the resource.
                _ => bare.with_resource(&random_id(12))?,
            };
            while !server.try_bind(full.clone(), connection) {
                debug!(conn_id = connection.id(), jid = %full, "Resource taken, picking another");
                full = bare.with_resource(&random_id(12))?;
            }
            connection.update_context(|ctx| ctx.jid = Some(full.clone()));
            info!(conn_id = connection.id(), jid = %full, "Resource bound");

            connection.send(iq_result(iq).with_child(
                Element::new_ns("bind", NS_BIND)
                    .with_child(Element::new_ns("jid", NS_BIND).with_text(full.to_string())),
            ))?;
            Ok(())
        });
    }

    fn features(&self, ctx: &ConnectionContext) -> Vec<Element> {
        match &ctx.jid {
            Some(jid) if ctx.authenticated && jid.is_bare() => {
                vec![Element::new_ns("bind", NS_BIND)]
            }
            _ => Vec::new(),
        }
    }
}

// --- session ---

pub struct SessionModule;

impl ServerModule for SessionModule {
    fn name(&self) -> &'static str {
        "session"
    }

    fn install(&self, server: &ServerContext) {
        server.register(DispatchKey::stanza("iq", NS_CLIENT), |inbound: &Inbound| -> HandlerResult {
            let Some(iq) = inbound.stanza().filter(|iq| is_set_with(iq, "session", NS_SESSION)) else {
                return Ok(());
            };
            let connection = &inbound.connection;
            let bound = connection
                .jid()
                .is_some_and(|jid| !jid.is_bare());
            if !bound {
                connection.send(iq_error(iq, "auth", "not-authorized"))?;
                return Ok(());
            }

            connection.update_context(|ctx| ctx.session_established = true);
            if let Err(e) = connection
                .state()
                .transition(ConnectionState::LoggedIn, &[ConnectionState::LoggingIn])
            {
                debug!(conn_id = connection.id(), error = %e, "State unchanged after session");
            }
            info!(conn_id = connection.id(), "Session established");
            connection.send(iq_result(iq).with_attr("from", inbound.server.domain()))?;
            Ok(())
        });
    }

    fn features(&self, ctx: &ConnectionContext) -> Vec<Element> {
        if ctx.authenticated && !ctx.session_established {
            vec![Element::new_ns("session", NS_SESSION)]
        } else {
            Vec::new()
        }
    }
}

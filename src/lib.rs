//! XMPP protocol engine.
//!
//! An incremental stanza codec, a concurrent dispatch registry and the
//! connection state machines that drive an XMPP client or server through
//! stream negotiation (STARTTLS, SASL PLAIN, resource binding, session).

pub mod client;
pub mod connection;
pub mod element;
pub mod error;
pub mod jid;
pub mod registry;
pub mod server;
pub mod stream;

pub use client::{ClientConfig, ClientModule, XmppClient};
pub use connection::{ConnectionState, Outbox};
pub use element::Element;
pub use error::{CodecError, EngineError, JidError};
pub use jid::Jid;
pub use registry::{Delivery, DispatchKey, DispatchRegistry, Registration};
pub use server::{ServerConfig, ServerModule, XmppServer};
pub use stream::{Outbound, StanzaCodec, StreamEvent};

//! XMPP stream framing: events produced by the codecs, outbound values and
//! the hand-built stream envelope fragments.

pub mod codec;
mod namespaces;
pub mod websocket;

pub use codec::StanzaCodec;
pub use websocket::WebSocketFraming;

use quick_xml::escape::escape;

use crate::element::{Attribute, Element};

pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_CLIENT: &str = "jabber:client";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const NS_FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
pub const NS_XML: &str = "http://www.w3.org/XML/1998/namespace";

/// Qualified name of the stream envelope.
pub const STREAM_ELEMENT: &str = "stream:stream";

/// Literal stream close fragment.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Build the opening `<stream:stream>` fragment.
///
/// This is written verbatim rather than serialized from an [`Element`]: the
/// envelope stays open for the whole session, so a tree serializer would
/// close it immediately.
pub fn stream_open(from: Option<&str>, to: Option<&str>, id: Option<&str>) -> String {
    let mut open = String::from("<?xml version='1.0'?><stream:stream");
    for (name, value) in [("from", from), ("to", to), ("id", id)] {
        if let Some(value) = value {
            open.push_str(&format!(" {}='{}'", name, escape(value)));
        }
    }
    open.push_str(" version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>");
    open
}

/// Attributes declared on a peer's stream envelope (namespace declarations
/// excluded).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub attributes: Vec<Attribute>,
}

impl StreamHeader {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn to(&self) -> Option<&str> {
        self.get("to")
    }

    pub fn from(&self) -> Option<&str> {
        self.get("from")
    }

    pub fn id(&self) -> Option<&str> {
        self.get("id")
    }

    pub fn version(&self) -> Option<&str> {
        self.get("version")
    }
}

/// Output of the stream codecs, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    StreamStart(StreamHeader),
    StreamEnd,
    Stanza(Element),
}

/// Anything that can be written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Element(Element),
    /// Written verbatim; used for the stream envelope fragments.
    Raw(String),
    Bytes(Vec<u8>),
}

impl From<Element> for Outbound {
    fn from(element: Element) -> Self {
        Outbound::Element(element)
    }
}

impl From<String> for Outbound {
    fn from(raw: String) -> Self {
        Outbound::Raw(raw)
    }
}

impl From<&str> for Outbound {
    fn from(raw: &str) -> Self {
        Outbound::Raw(raw.to_owned())
    }
}

impl From<Vec<u8>> for Outbound {
    fn from(bytes: Vec<u8>) -> Self {
        Outbound::Bytes(bytes)
    }
}

//! RFC 7395 framing for XMPP over WebSocket.
//!
//! Every WebSocket text message carries exactly one standalone element. The
//! stream envelope is replaced by `<open/>` and `<close/>` in the
//! `urn:ietf:params:xml:ns:xmpp-framing` namespace:
//! - `<open/>` ↔ `<stream:stream ...>`
//! - `<close/>` ↔ `</stream:stream>`
//! - `<stream:features>` → `<features xmlns="http://etherx.jabber.org/streams">`
//!
//! Inbound frames are turned into the same [`StreamEvent`]s the TCP codec
//! produces, so registry handlers never see the difference.

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

use super::codec::StanzaCodec;
use super::{Outbound, StreamEvent, StreamHeader, NS_FRAMING, NS_STREAMS, STREAM_CLOSE};
use crate::element::{Attribute, Element};
use crate::error::CodecError;

pub struct WebSocketFraming {
    codec: StanzaCodec,
}

impl WebSocketFraming {
    pub fn new(max_stanza_size: usize) -> Self {
        Self {
            codec: StanzaCodec::for_fragments(max_stanza_size),
        }
    }

    /// Decode one text frame.
    pub fn decode(&mut self, frame: &str) -> Result<Vec<StreamEvent>, CodecError> {
        let events = self.codec.feed(frame.as_bytes())?;
        Ok(events
            .into_iter()
            .map(|event| match event {
                StreamEvent::Stanza(el) if el.is("open", NS_FRAMING) => {
                    StreamEvent::StreamStart(StreamHeader {
                        attributes: el.attributes().to_vec(),
                    })
                }
                StreamEvent::Stanza(el) if el.is("close", NS_FRAMING) => StreamEvent::StreamEnd,
                other => other,
            })
            .collect())
    }

    /// Text of the frame carrying `outbound`.
    pub fn encode(&self, outbound: Outbound) -> Result<String, CodecError> {
        match outbound {
            Outbound::Element(element) => unprefix_stream_element(element).to_xml(),
            Outbound::Raw(raw) => Ok(translate_envelope(&raw)?.unwrap_or(raw)),
            Outbound::Bytes(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                Ok(translate_envelope(&text)?.unwrap_or(text))
            }
        }
    }
}

/// `<open/>` or `<close/>` for a raw stream envelope fragment, `None` for
/// anything else.
fn translate_envelope(raw: &str) -> Result<Option<String>, CodecError> {
    let trimmed = raw.trim();
    if trimmed == STREAM_CLOSE {
        return Element::new_ns("close", NS_FRAMING).to_xml().map(Some);
    }

    // Strip the optional XML declaration.
    let stream_text = match trimmed.strip_prefix("<?xml") {
        Some(rest) => rest.find("?>").map_or(trimmed, |pos| rest[pos + 2..].trim()),
        None => trimmed,
    };
    if !stream_text.starts_with("<stream:stream") {
        return Ok(None);
    }

    let mut reader = Reader::from_str(stream_text);
    reader.config_mut().check_end_names = false;
    let start = match reader.read_event() {
        Ok(Event::Start(start)) | Ok(Event::Empty(start)) => start,
        other => {
            warn!(event = ?other, "Could not parse stream header for WebSocket framing");
            return Ok(None);
        }
    };

    let mut open = Element::new_ns("open", NS_FRAMING);
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = match attr.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        open.push_attribute(Attribute::new(key, value));
    }
    open.to_xml().map(Some)
}

/// Standalone frames cannot rely on the envelope's `xmlns:stream`, so
/// `stream:`-prefixed elements are sent unprefixed with an explicit namespace.
fn unprefix_stream_element(element: Element) -> Element {
    if element.prefix() != Some("stream") {
        return element;
    }
    let mut bare = Element::new_ns(element.local_name(), NS_STREAMS);
    for attr in element.attributes() {
        bare.push_attribute(attr.clone());
    }
    for node in element.nodes() {
        bare.append_node(node.clone());
    }
    bare
}

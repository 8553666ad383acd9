//! Incremental stanza codec.
//!
//! Bytes arrive in arbitrary chunks. Each `feed` appends to a pending buffer,
//! runs a fresh quick-xml reader over it and consumes only complete tokens;
//! whatever is left (half a tag, a text run that may continue, a split UTF-8
//! sequence) stays pending for the next call. Nesting depth, namespace scopes
//! and the stanza under construction live in the codec, so they carry over
//! between readers.
//!
//! Depth 0 is outside the stream, the `<stream:stream>` envelope opens depth
//! 1 and every element that starts at depth 1 is a stanza.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, error, warn};

use super::namespaces::{NamespaceScopes, Resolved};
use super::{Outbound, StreamEvent, StreamHeader, NS_CLIENT, NS_STREAMS};
use crate::element::{Attribute, Element, Node};
use crate::error::CodecError;

/// Maximum size of a single stanza.
///
/// Typical stanzas are a few KB; the largest legitimate ones (vCard avatars,
/// archive result pages) rarely exceed 100 KB. A peer that keeps sending data
/// that never completes a stanza is cut off at this limit.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 1_024 * 1_024;

const STREAM_DEPTH: usize = 1;

/// Tree for the stanza currently being parsed.
struct ElementBuilder {
    open: Vec<Element>,
}

impl ElementBuilder {
    fn new(root: Element) -> Self {
        Self { open: vec![root] }
    }

    fn start(&mut self, element: Element) {
        self.open.push(element);
    }

    fn text(&mut self, text: &str) {
        if let Some(top) = self.open.last_mut() {
            top.append_text(text);
        }
    }

    fn comment(&mut self, text: String) {
        if let Some(top) = self.open.last_mut() {
            top.append_node(Node::Comment(text));
        }
    }

    /// Close the innermost open element. Returns the root once it closes.
    fn end(&mut self, name: &str) -> Result<Option<Element>, CodecError> {
        let element = self
            .open
            .pop()
            .ok_or_else(|| CodecError::UnexpectedEndTag(name.to_owned()))?;
        if element.name() != name {
            return Err(CodecError::MismatchedEndTag {
                expected: element.name().to_owned(),
                found: name.to_owned(),
            });
        }
        match self.open.last_mut() {
            Some(parent) => {
                parent.append_child(element);
                Ok(None)
            }
            None => Ok(Some(element)),
        }
    }
}

/// Stateful decoder/encoder for one XMPP stream.
pub struct StanzaCodec {
    pending: Vec<u8>,
    scopes: NamespaceScopes,
    builder: Option<ElementBuilder>,
    stream_name: Option<String>,
    stanza_bytes: usize,
    max_stanza_size: usize,
    failed: bool,
}

impl Default for StanzaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl StanzaCodec {
    pub fn new() -> Self {
        Self::with_max_stanza_size(DEFAULT_MAX_STANZA_SIZE)
    }

    pub fn with_max_stanza_size(max_stanza_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            scopes: NamespaceScopes::new(),
            builder: None,
            stream_name: None,
            stanza_bytes: 0,
            max_stanza_size,
            failed: false,
        }
    }

    /// Codec positioned inside an implicit `jabber:client` stream, for
    /// transports that frame each stanza as a standalone document.
    pub(crate) fn for_fragments(max_stanza_size: usize) -> Self {
        let mut codec = Self::with_max_stanza_size(max_stanza_size);
        codec.scopes.push(vec![
            (None, NS_CLIENT.to_owned()),
            (Some("stream".to_owned()), NS_STREAMS.to_owned()),
        ]);
        codec
    }

    /// Whether the peer's stream envelope is currently open.
    pub fn is_stream_open(&self) -> bool {
        self.stream_name.is_some()
    }

    /// Bytes received but not yet decoded.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Consume a chunk and return every event it completes.
    ///
    /// An error is fatal: the codec refuses any further input afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, CodecError> {
        if self.failed {
            return Err(CodecError::Poisoned);
        }
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        match self.drain(&mut events) {
            Ok(()) => Ok(events),
            Err(e) => {
                error!(error = %e, "Fatal stream decode error");
                self.failed = true;
                self.pending.clear();
                self.builder = None;
                Err(e)
            }
        }
    }

    fn drain(&mut self, events: &mut Vec<StreamEvent>) -> Result<(), CodecError> {
        let input = std::mem::take(&mut self.pending);
        let consumed = self.parse(&input, events)?;
        self.pending = input;
        self.pending.drain(..consumed);

        if self.builder.is_some() && self.stanza_bytes + self.pending.len() > self.max_stanza_size
        {
            return Err(CodecError::StanzaTooLarge {
                limit: self.max_stanza_size,
            });
        }
        if self.pending.len() > self.max_stanza_size {
            return Err(CodecError::StanzaTooLarge {
                limit: self.max_stanza_size,
            });
        }
        Ok(())
    }

    /// Parse complete tokens from `input`, returning how many bytes they used.
    fn parse(&mut self, input: &[u8], events: &mut Vec<StreamEvent>) -> Result<usize, CodecError> {
        let mut reader = Reader::from_reader(input);
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = false;
        // Elements opened by an earlier feed close in this reader.
        config.allow_unmatched_ends = true;

        let mut consumed = 0;
        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(quick_xml::Error::Syntax(kind)) if is_incomplete(kind, &input[consumed..]) => {
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            let end = reader.buffer_position() as usize;

            match event {
                Event::Eof => break,
                // A text run touching the end of the buffer may continue in the
                // next chunk (possibly mid-character or mid-entity).
                Event::Text(_) if end >= input.len() => break,
                Event::Text(text) => {
                    let text = text.unescape()?;
                    self.on_text(&text);
                }
                Event::CData(cdata) => {
                    let text = std::str::from_utf8(&cdata)?;
                    self.on_text(text);
                }
                Event::Start(start) => self.on_start(&start, false, events)?,
                Event::Empty(start) => self.on_start(&start, true, events)?,
                Event::End(end_tag) => {
                    let name = std::str::from_utf8(end_tag.name().as_ref())?.to_owned();
                    self.on_end(&name, events)?;
                }
                Event::Comment(comment) => {
                    if let Some(builder) = self.builder.as_mut() {
                        builder.comment(std::str::from_utf8(&comment)?.to_owned());
                    }
                }
                Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            }

            if self.builder.is_some() {
                self.stanza_bytes += end - consumed;
                if self.stanza_bytes > self.max_stanza_size {
                    return Err(CodecError::StanzaTooLarge {
                        limit: self.max_stanza_size,
                    });
                }
            }
            consumed = end;
        }
        Ok(consumed)
    }

    fn on_start(
        &mut self,
        start: &BytesStart<'_>,
        empty: bool,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), CodecError> {
        let name = std::str::from_utf8(start.name().as_ref())?.to_owned();

        let mut declarations = Vec::new();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let key = std::str::from_utf8(attr.key.as_ref())?;
            let value = attr.unescape_value()?.into_owned();
            if key == "xmlns" {
                declarations.push((None, value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                declarations.push((Some(prefix.to_owned()), value));
            } else {
                attributes.push((key.to_owned(), value));
            }
        }

        let depth = self.scopes.depth();
        self.scopes.push(declarations);
        let element = self.build_element(&name, attributes);

        if depth == 0 {
            if !element.is("stream", NS_STREAMS) {
                warn!(element = %name, "Unexpected stream root element");
            }
            self.stream_name = Some(name.clone());
            events.push(StreamEvent::StreamStart(StreamHeader {
                attributes: element.attributes().to_vec(),
            }));
            debug!(element = %name, "Stream opened");
        } else if depth == STREAM_DEPTH {
            self.stanza_bytes = 0;
            self.builder = Some(ElementBuilder::new(element));
        } else if let Some(builder) = self.builder.as_mut() {
            builder.start(element);
        }

        if empty {
            self.on_end(&name, events)?;
        }
        Ok(())
    }

    fn on_end(&mut self, name: &str, events: &mut Vec<StreamEvent>) -> Result<(), CodecError> {
        match self.scopes.depth() {
            0 => return Err(CodecError::UnexpectedEndTag(name.to_owned())),
            STREAM_DEPTH => {
                match self.stream_name.take() {
                    Some(expected) if expected == name => {}
                    Some(expected) => {
                        return Err(CodecError::MismatchedEndTag {
                            expected,
                            found: name.to_owned(),
                        })
                    }
                    None => return Err(CodecError::UnexpectedEndTag(name.to_owned())),
                }
                events.push(StreamEvent::StreamEnd);
                debug!("Stream closed by peer");
            }
            _ => {
                let builder = self
                    .builder
                    .as_mut()
                    .ok_or_else(|| CodecError::UnexpectedEndTag(name.to_owned()))?;
                if let Some(stanza) = builder.end(name)? {
                    self.builder = None;
                    self.stanza_bytes = 0;
                    debug!(stanza = %stanza.name(), "Decoded stanza");
                    events.push(StreamEvent::Stanza(stanza));
                }
            }
        }
        self.scopes.pop();
        Ok(())
    }

    fn on_text(&mut self, text: &str) {
        match self.builder.as_mut() {
            Some(builder) => builder.text(text),
            None if !text.trim().is_empty() => {
                warn!(len = text.len(), "Ignoring character data outside of a stanza");
            }
            None => {}
        }
    }

    fn build_element(&self, name: &str, attributes: Vec<(String, String)>) -> Element {
        let mut element = Element::new(name);
        let namespace = match self.scopes.resolve_element(prefix_of(name)) {
            Resolved::Namespace(uri) => Some(uri.to_owned()),
            Resolved::Unqualified => Some(String::new()),
            Resolved::Unbound => {
                warn!(element = %name, "Unbound namespace prefix, treating element as unqualified");
                None
            }
        };
        element.set_namespace(namespace);

        for (key, value) in attributes {
            let namespace = match self.scopes.resolve_attribute(prefix_of(&key)) {
                Resolved::Namespace(uri) => Some(uri.to_owned()),
                Resolved::Unqualified => None,
                Resolved::Unbound => {
                    warn!(element = %name, attribute = %key, "Unbound attribute prefix");
                    None
                }
            };
            element.push_attribute(Attribute {
                name: key,
                namespace,
                value,
            });
        }
        element
    }

    /// Serialize an outbound value. Elements are written relative to the
    /// `jabber:client` default namespace of the stream. On error nothing is
    /// returned, so a partial stanza never reaches the wire.
    pub fn encode(&self, outbound: Outbound) -> Result<Vec<u8>, CodecError> {
        match outbound {
            Outbound::Element(element) => {
                let mut writer = Writer::new(Vec::new());
                element.write_to(&mut writer, Some(NS_CLIENT))?;
                Ok(writer.into_inner())
            }
            Outbound::Raw(raw) => Ok(raw.into_bytes()),
            Outbound::Bytes(bytes) => Ok(bytes),
        }
    }
}

fn prefix_of(name: &str) -> Option<&str> {
    name.split_once(':').map(|(prefix, _)| prefix)
}

/// Whether a syntax error only means the input stops mid-token.
fn is_incomplete(kind: SyntaxError, rest: &[u8]) -> bool {
    match kind {
        SyntaxError::UnclosedTag
        | SyntaxError::UnclosedComment
        | SyntaxError::UnclosedCData
        | SyntaxError::UnclosedPIOrXmlDecl
        | SyntaxError::UnclosedDoctype => true,
        // `<!` at the very end: not yet known whether a comment or CDATA follows.
        SyntaxError::InvalidBangMarkup => rest.len() <= 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{NS_BIND, NS_SASL, NS_TLS};

    const STREAM_OPEN: &[u8] = b"<?xml version='1.0'?><stream:stream to='example.org' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    fn feed_all(codec: &mut StanzaCodec, chunks: &[&[u8]]) -> Vec<StreamEvent> {
        chunks
            .iter()
            .flat_map(|chunk| codec.feed(chunk).expect("valid chunk"))
            .collect()
    }

    fn stanza(event: &StreamEvent) -> &Element {
        match event {
            StreamEvent::Stanza(el) => el,
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    fn open_codec() -> StanzaCodec {
        let mut codec = StanzaCodec::new();
        let events = codec.feed(STREAM_OPEN).expect("stream open");
        assert_eq!(events.len(), 1);
        codec
    }

    // --- stream envelope ---

    #[test]
    fn test_stream_open_produces_stream_start() {
        let mut codec = StanzaCodec::new();
        let events = codec.feed(STREAM_OPEN).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::StreamStart(header) => {
                assert_eq!(header.to(), Some("example.org"));
                assert_eq!(header.version(), Some("1.0"));
                // Namespace declarations are not reported as attributes.
                assert!(header.get("xmlns").is_none());
                assert!(header.get("xmlns:stream").is_none());
            }
            other => panic!("expected stream start, got {:?}", other),
        }
        assert!(codec.is_stream_open());
    }

    #[test]
    fn test_stream_close_produces_stream_end() {
        let mut codec = open_codec();
        let events = codec.feed(b"</stream:stream>").unwrap();
        assert_eq!(events, vec![StreamEvent::StreamEnd]);
        assert!(!codec.is_stream_open());
    }

    #[test]
    fn test_partial_stream_open_yields_nothing() {
        let mut codec = StanzaCodec::new();
        assert!(codec.feed(&STREAM_OPEN[..40]).unwrap().is_empty());
        let events = codec.feed(&STREAM_OPEN[40..]).unwrap();
        assert!(matches!(events[0], StreamEvent::StreamStart(_)));
    }

    #[test]
    fn test_empty_feed() {
        let mut codec = open_codec();
        assert!(codec.feed(b"").unwrap().is_empty());
    }

    // --- stanzas ---

    #[test]
    fn test_features_stanza_keeps_nested_children() {
        let mut codec = open_codec();
        let events = codec
            .feed(b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>")
            .unwrap();
        assert_eq!(events.len(), 1);
        let features = stanza(&events[0]);
        assert!(features.is("features", NS_STREAMS));

        let starttls = features.child("starttls", NS_TLS).expect("starttls");
        // `required` inherits the starttls namespace.
        assert!(starttls.has_child("required", NS_TLS));
        let mechanisms = features.child("mechanisms", NS_SASL).expect("mechanisms");
        assert_eq!(mechanisms.child_text("mechanism", NS_SASL).as_deref(), Some("PLAIN"));
    }

    #[test]
    fn test_self_closing_stanza() {
        let mut codec = open_codec();
        let events = codec.feed(b"<presence/>").unwrap();
        let presence = stanza(&events[0]);
        assert!(presence.is("presence", NS_CLIENT));
        assert!(presence.nodes().is_empty());
    }

    #[test]
    fn test_multiple_stanzas_in_one_chunk() {
        let mut codec = open_codec();
        let events = codec
            .feed(b"<presence/>\n<message to='a@example.org'><body>hi</body></message><iq type='get' id='1'/>")
            .unwrap();
        let names: Vec<&str> = events.iter().map(|e| stanza(e).name()).collect();
        assert_eq!(names, vec!["presence", "message", "iq"]);
    }

    #[test]
    fn test_stanza_split_across_feeds() {
        let mut codec = open_codec();
        assert!(codec.feed(b"<message to='a@exa").unwrap().is_empty());
        assert!(codec.feed(b"mple.org'><bo").unwrap().is_empty());
        assert!(codec.feed(b"dy>hel").unwrap().is_empty());
        let events = codec.feed(b"lo</body></message>").unwrap();
        let message = stanza(&events[0]);
        assert_eq!(message.attr("to"), Some("a@example.org"));
        assert_eq!(message.child_text("body", NS_CLIENT).as_deref(), Some("hello"));
        // Split text merges into a single node.
        assert_eq!(message.child("body", NS_CLIENT).unwrap().nodes().len(), 1);
    }

    #[test]
    fn test_text_entities_and_cdata() {
        let mut codec = open_codec();
        let events = codec
            .feed(b"<message><body>a &amp; b &lt; c<![CDATA[ <raw> ]]></body></message>")
            .unwrap();
        let body = stanza(&events[0]).child("body", NS_CLIENT).unwrap().text();
        assert_eq!(body, "a & b < c <raw> ");
    }

    #[test]
    fn test_entity_split_across_feeds() {
        let mut codec = open_codec();
        assert!(codec.feed(b"<message><body>fish &am").unwrap().is_empty());
        let events = codec.feed(b"p; chips</body></message>").unwrap();
        assert_eq!(
            stanza(&events[0]).child_text("body", NS_CLIENT).as_deref(),
            Some("fish & chips")
        );
    }

    #[test]
    fn test_utf8_split_mid_character() {
        let mut codec = open_codec();
        let xml = "<message><body>caf\u{e9} \u{1f600}</body></message>".as_bytes();
        // Split inside the two-byte é and inside the four-byte emoji.
        let e_acute = xml.iter().position(|&b| b == 0xC3).unwrap();
        let emoji = xml.iter().position(|&b| b == 0xF0).unwrap();
        let events = feed_all(
            &mut codec,
            &[&xml[..e_acute + 1], &xml[e_acute + 1..emoji + 2], &xml[emoji + 2..]],
        );
        assert_eq!(
            stanza(&events[0]).child_text("body", NS_CLIENT).as_deref(),
            Some("caf\u{e9} \u{1f600}")
        );
    }

    #[test]
    fn test_attribute_order_preserved() {
        let mut codec = open_codec();
        let events = codec
            .feed(b"<iq type='set' id='bind' to='example.org' xml:lang='en'/>")
            .unwrap();
        let iq = stanza(&events[0]);
        let names: Vec<&str> = iq.attributes().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["type", "id", "to", "xml:lang"]);
        assert_eq!(iq.attributes()[3].namespace.as_deref(), Some(crate::stream::NS_XML));
    }

    #[test]
    fn test_comments_kept_inside_stanza_and_dropped_outside() {
        let mut codec = open_codec();
        let events = codec
            .feed(b"<!-- keepalive --><message><!--note--><body>x</body></message>")
            .unwrap();
        assert_eq!(events.len(), 1);
        let message = stanza(&events[0]);
        assert_eq!(message.nodes()[0], Node::Comment("note".into()));
    }

    #[test]
    fn test_comment_split_at_bang() {
        let mut codec = open_codec();
        assert!(codec.feed(b"<message><!").unwrap().is_empty());
        assert!(codec.feed(b"-- c -").unwrap().is_empty());
        let events = codec.feed(b"-><body>x</body></message>").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_whitespace_keepalive_is_ignored() {
        let mut codec = open_codec();
        assert!(codec.feed(b" \n ").unwrap().is_empty());
        let events = codec.feed(b"<presence/>").unwrap();
        assert_eq!(events.len(), 1);
    }

    // --- namespaces ---

    #[test]
    fn test_default_namespace_inherited_from_stream() {
        let mut codec = open_codec();
        let events = codec
            .feed(b"<iq type='result' id='bind'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>a@b/c</jid></bind></iq>")
            .unwrap();
        let iq = stanza(&events[0]);
        assert_eq!(iq.namespace(), Some(NS_CLIENT));
        let bind = iq.child("bind", NS_BIND).expect("bind");
        assert_eq!(bind.child_text("jid", NS_BIND).as_deref(), Some("a@b/c"));
    }

    #[test]
    fn test_unbound_prefix_degrades_to_no_namespace() {
        let mut codec = open_codec();
        let events = codec.feed(b"<foo:bar><baz/></foo:bar>").unwrap();
        let el = stanza(&events[0]);
        assert_eq!(el.name(), "foo:bar");
        assert_eq!(el.namespace(), None);
        // Later stanzas are unaffected.
        let events = codec.feed(b"<presence/>").unwrap();
        assert_eq!(stanza(&events[0]).namespace(), Some(NS_CLIENT));
    }

    // --- errors ---

    #[test]
    fn test_mismatched_end_tag_is_fatal() {
        let mut codec = open_codec();
        let err = codec.feed(b"<message><body>x</message>").unwrap_err();
        assert!(matches!(err, CodecError::MismatchedEndTag { .. }), "got {:?}", err);
        assert!(matches!(codec.feed(b"<presence/>"), Err(CodecError::Poisoned)));
    }

    /// Feed `bytes` one at a time, returning the events before the first
    /// error and that error.
    fn feed_bytewise(codec: &mut StanzaCodec, bytes: &[u8]) -> (Vec<StreamEvent>, Option<CodecError>) {
        let mut events = Vec::new();
        for byte in bytes {
            match codec.feed(std::slice::from_ref(byte)) {
                Ok(more) => events.extend(more),
                Err(e) => return (events, Some(e)),
            }
        }
        (events, None)
    }

    #[test]
    fn test_stream_close_inside_open_stanza_is_fatal_bytewise() {
        let mut codec = open_codec();
        assert!(codec.feed(b"<message><body>hi").expect("partial").is_empty());

        let (events, err) = feed_bytewise(&mut codec, b"</stream:stream>");
        assert!(events.is_empty(), "got {:?}", events);
        match err {
            Some(CodecError::MismatchedEndTag { expected, found }) => {
                assert_eq!(expected, "body");
                assert_eq!(found, "stream:stream");
            }
            other => panic!("expected a mismatch, got {:?}", other),
        }
        assert!(matches!(codec.feed(b"<presence/>"), Err(CodecError::Poisoned)));
    }

    #[test]
    fn test_unprefixed_stream_close_is_fatal_bytewise() {
        let mut codec = open_codec();
        let (events, err) = feed_bytewise(&mut codec, b"<presence/></stream>");
        assert_eq!(events.len(), 1);
        assert_eq!(stanza(&events[0]).name(), "presence");
        match err {
            Some(CodecError::MismatchedEndTag { expected, found }) => {
                assert_eq!(expected, "stream:stream");
                assert_eq!(found, "stream");
            }
            other => panic!("expected a mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_end_tag_before_stream_open_is_fatal() {
        let mut codec = StanzaCodec::new();
        let err = codec.feed(b"</message>").unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEndTag(_)));
    }

    #[test]
    fn test_unknown_entity_is_fatal() {
        let mut codec = open_codec();
        let err = codec.feed(b"<message><body>&bogus;</body></message>").unwrap_err();
        assert!(matches!(err, CodecError::Xml(_)), "got {:?}", err);
    }

    #[test]
    fn test_oversized_stanza_rejected() {
        let mut codec = StanzaCodec::with_max_stanza_size(64);
        codec.feed(STREAM_OPEN).unwrap();
        let body = format!("<message><body>{}</body></message>", "x".repeat(100));
        let err = codec.feed(body.as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::StanzaTooLarge { limit: 64 }));
    }

    #[test]
    fn test_oversized_partial_stanza_rejected() {
        let mut codec = StanzaCodec::with_max_stanza_size(64);
        codec.feed(STREAM_OPEN).unwrap();
        codec.feed(b"<message><body>").unwrap();
        let err = codec.feed("y".repeat(80).as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::StanzaTooLarge { .. }));
    }

    // --- whole sessions ---

    #[test]
    fn test_client_session_transcript() {
        let transcript: &[&[u8]] = &[
            STREAM_OPEN,
            b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
            b"<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGp1bGlldAByMG0zMA==</auth>",
            b"<iq type='set' id='bind'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>balcony</resource></bind></iq>",
            b"<iq to='example.org' type='set' id='session'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
            b"<presence><show>chat</show><status>around</status></presence>",
            b"<message to='romeo@example.net' type='chat'><body>Wherefore art thou?</body></message>",
            b"</stream:stream>",
        ];

        let whole: Vec<u8> = transcript.concat();
        let mut codec = StanzaCodec::new();
        let events = codec.feed(&whole).unwrap();

        assert!(matches!(events.first(), Some(StreamEvent::StreamStart(_))));
        assert_eq!(events.last(), Some(&StreamEvent::StreamEnd));
        let stanzas = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Stanza(_)))
            .count();
        assert_eq!(stanzas, 6);

        // Byte-at-a-time delivery gives the same events.
        let mut trickle = StanzaCodec::new();
        let chunks: Vec<&[u8]> = whole.chunks(1).collect();
        assert_eq!(feed_all(&mut trickle, &chunks), events);
    }

    // --- encoding ---

    #[test]
    fn test_encode_element_omits_stream_default_namespace() {
        let codec = StanzaCodec::new();
        let iq = Element::new_ns("iq", NS_CLIENT)
            .with_attr("type", "result")
            .with_attr("id", "session");
        assert_eq!(
            codec.encode(iq.into()).expect("encode"),
            br#"<iq type="result" id="session"/>"#.to_vec()
        );
    }

    #[test]
    fn test_encode_raw_and_bytes_pass_through() {
        let codec = StanzaCodec::new();
        assert_eq!(
            codec.encode(Outbound::from("</stream:stream>")).expect("encode"),
            b"</stream:stream>".to_vec()
        );
        assert_eq!(codec.encode(Outbound::Bytes(vec![b' '])).expect("encode"), vec![b' ']);
    }

    #[test]
    fn test_encode_failure_yields_no_bytes() {
        let codec = StanzaCodec::new();
        let message = Element::new("message")
            .with_attr("to", "juliet@example.com")
            .with_child(Element::new("body").with_text("hi"))
            .with_child(Element::new("not a name"));
        match codec.encode(message.into()) {
            Err(CodecError::InvalidName(name)) => assert_eq!(name, "not a name"),
            other => panic!("expected invalid name, got {other:?}"),
        }
    }

    #[test]
    fn test_unqualified_and_prefixed_attributes_survive_reencode() {
        let mut codec = open_codec();
        let events = codec
            .feed(b"<iq type='result' id='r1'><query xmlns='jabber:iq:roster'><item xmlns='' xmlns:x='urn:example:ref' x:ref='7' jid='romeo@example.net'/></query></iq>")
            .unwrap();
        let iq = stanza(&events[0]);
        let query = iq.child("query", "jabber:iq:roster").expect("query");
        let item = query.children().next().expect("item");
        assert_eq!(item.namespace(), Some(""));

        let bytes = codec.encode(iq.clone().into()).expect("encode");
        let xml = String::from_utf8(bytes.clone()).expect("utf-8");
        assert!(xml.contains(r#"<item xmlns="" xmlns:x="urn:example:ref" x:ref="7""#), "got {xml}");

        let events = codec.feed(&bytes).unwrap();
        assert_eq!(stanza(&events[0]), iq);
    }

    #[test]
    fn test_encode_then_decode_preserves_tree() {
        let original = Element::new("message")
            .with_attr("to", "juliet@example.com")
            .with_attr("type", "chat")
            .with_child(Element::new("body").with_text("O Romeo, <Romeo> & co"))
            .with_child(
                Element::new_ns("active", "http://jabber.org/protocol/chatstates"),
            );

        let mut codec = open_codec();
        let bytes = codec.encode(original.clone().into()).expect("encode");
        let events = codec.feed(&bytes).unwrap();
        let decoded = stanza(&events[0]);

        // Decoded elements carry the resolved stream namespace.
        assert_eq!(decoded.namespace(), Some(NS_CLIENT));
        assert_eq!(decoded.attributes(), original.attributes());
        assert_eq!(
            decoded.child_text("body", NS_CLIENT),
            Some("O Romeo, <Romeo> & co".into())
        );
        assert!(decoded.has_child("active", "http://jabber.org/protocol/chatstates"));
    }

    #[test]
    fn test_fragment_codec_decodes_standalone_elements() {
        let mut codec = StanzaCodec::for_fragments(DEFAULT_MAX_STANZA_SIZE);
        let events = codec
            .feed(b"<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='example.org' version='1.0'/>")
            .unwrap();
        let open = stanza(&events[0]);
        assert!(open.is("open", crate::stream::NS_FRAMING));

        let events = codec.feed(b"<iq type='get' id='x'/>").unwrap();
        assert_eq!(stanza(&events[0]).namespace(), Some(NS_CLIENT));
    }
}

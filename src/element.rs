//! Owned XML element tree used for every stanza that crosses the engine.
//!
//! The codec builds these while parsing; application code builds them to send.
//! Attribute and child order is preserved so a decoded stanza re-serializes
//! the way it arrived.

use std::fmt;
use std::io::Write;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::CodecError;

/// A single attribute. `name` is the qualified name as written (`xml:lang`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub namespace: Option<String>,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            value: value.into(),
        }
    }
}

/// Child node of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<Attribute>,
    nodes: Vec<Node>,
}

impl Element {
    /// Element without a namespace of its own; it inherits the enclosing one
    /// when serialized.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn new_ns(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::new(name)
        }
    }

    /// Qualified name, e.g. `stream:features`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    /// `None` inherits the enclosing default namespace. `Some("")` is an
    /// element explicitly in no namespace, written with `xmlns=""` when a
    /// default is in scope.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn set_namespace(&mut self, namespace: Option<String>) {
        self.namespace = namespace;
    }

    /// Whether this element is `local_name` in namespace `ns`.
    pub fn is(&self, local_name: &str, ns: &str) -> bool {
        self.local_name() == local_name && self.namespace() == Some(ns)
    }

    // --- Attributes ---

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Set an attribute, replacing an existing value in place so the original
    /// position is kept.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute::new(name, value)),
        }
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let index = self.attributes.iter().position(|a| a.name == name)?;
        Some(self.attributes.remove(index).value)
    }

    /// Append a fully specified attribute (used by the parser, which already
    /// resolved its namespace).
    pub fn push_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    // --- Children ---

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn append_node(&mut self, node: Node) {
        match node {
            Node::Text(text) => {
                self.append_text(text);
            }
            other => self.nodes.push(other),
        }
    }

    pub fn append_child(&mut self, child: Element) -> &mut Self {
        self.nodes.push(Node::Element(child));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.append_child(child);
        self
    }

    /// Append character data. Consecutive runs merge into one text node.
    pub fn append_text(&mut self, text: impl Into<String>) -> &mut Self {
        let text = text.into();
        if text.is_empty() {
            return self;
        }
        match self.nodes.last_mut() {
            Some(Node::Text(existing)) => existing.push_str(&text),
            _ => self.nodes.push(Node::Text(text)),
        }
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.append_text(text);
        self
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.nodes.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// First child with the given local name and namespace.
    pub fn child(&self, local_name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|c| c.is(local_name, ns))
    }

    pub fn has_child(&self, local_name: &str, ns: &str) -> bool {
        self.child(local_name, ns).is_some()
    }

    pub fn child_text(&self, local_name: &str, ns: &str) -> Option<String> {
        self.child(local_name, ns).map(Element::text)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    // --- Serialization ---

    /// Serialize as a standalone XML fragment.
    pub fn to_xml(&self) -> Result<String, CodecError> {
        let mut writer = Writer::new(Vec::new());
        self.write_to(&mut writer, None)?;
        Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
    }

    /// Write this element. `inherited` is the default namespace already in
    /// scope at the insertion point; a declaration is only emitted when this
    /// element's namespace differs from it.
    ///
    /// Names are checked before anything is written for the element, but a
    /// failure in a descendant leaves the ancestors' start tags in `writer`.
    /// Callers that need all-or-nothing output write into a scratch buffer.
    pub fn write_to<W: Write>(
        &self,
        writer: &mut Writer<W>,
        inherited: Option<&str>,
    ) -> Result<(), CodecError> {
        if !is_xml_name(&self.name) {
            return Err(CodecError::InvalidName(self.name.clone()));
        }
        let mut start = BytesStart::new(self.name.as_str());
        let mut default_ns = inherited;
        let mut declared: Vec<&str> = Vec::new();

        if let Some(ns) = self.namespace.as_deref() {
            match self.prefix() {
                Some(prefix) => {
                    if !ns.is_empty() {
                        let decl = format!("xmlns:{prefix}");
                        start.push_attribute((decl.as_str(), ns));
                        declared.push(prefix);
                    }
                }
                None => {
                    if inherited.unwrap_or("") != ns {
                        start.push_attribute(("xmlns", ns));
                    }
                    default_ns = Some(ns);
                }
            }
        }
        for attr in &self.attributes {
            if !is_xml_name(&attr.name) {
                return Err(CodecError::InvalidName(attr.name.clone()));
            }
            let prefix = attr.name.split_once(':').map(|(prefix, _)| prefix);
            if let (Some(prefix), Some(ns)) = (prefix, attr.namespace.as_deref()) {
                if prefix != "xml" && !ns.is_empty() && !declared.contains(&prefix) {
                    let decl = format!("xmlns:{prefix}");
                    start.push_attribute((decl.as_str(), ns));
                    declared.push(prefix);
                }
            }
        }
        for attr in &self.attributes {
            start.push_attribute((attr.name.as_str(), attr.value.as_str()));
        }

        if self.nodes.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        for node in &self.nodes {
            match node {
                Node::Element(child) => child.write_to(writer, default_ns)?,
                Node::Text(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
                Node::Comment(text) => {
                    writer.write_event(Event::Comment(BytesText::from_escaped(text.as_str())))?
                }
            }
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }
}

/// Conservative XML `Name` check: at most one colon, and no characters that
/// would change the markup around the name.
fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
        && name.matches(':').count() <= 1
        && !name.ends_with(':')
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let xml = self.to_xml().map_err(|_| fmt::Error)?;
        f.write_str(&xml)
    }
}

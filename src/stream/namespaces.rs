//! Namespace scope tracking for the incremental parser.
//!
//! quick-xml's own resolver needs to see the whole document through one
//! reader, but the codec re-creates its reader on every feed, so scopes are
//! kept here and survive between chunks.

use super::NS_XML;

#[derive(Debug, Default)]
struct Scope {
    /// `(prefix, uri)`, `None` prefix is the default namespace. An empty uri
    /// undeclares the default namespace.
    declarations: Vec<(Option<String>, String)>,
}

/// Result of resolving an element or attribute prefix.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Resolved<'a> {
    Namespace(&'a str),
    /// Unprefixed name with no default namespace in scope.
    Unqualified,
    /// Prefix that was never declared.
    Unbound,
}

#[derive(Debug, Default)]
pub(crate) struct NamespaceScopes {
    scopes: Vec<Scope>,
}

impl NamespaceScopes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open a scope for an element with the given declarations.
    pub(crate) fn push(&mut self, declarations: Vec<(Option<String>, String)>) {
        self.scopes.push(Scope { declarations });
    }

    pub(crate) fn pop(&mut self) {
        self.scopes.pop();
    }

    pub(crate) fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub(crate) fn resolve_element(&self, prefix: Option<&str>) -> Resolved<'_> {
        if prefix == Some("xml") {
            return Resolved::Namespace(NS_XML);
        }
        for scope in self.scopes.iter().rev() {
            for (declared, uri) in scope.declarations.iter().rev() {
                if declared.as_deref() == prefix {
                    if uri.is_empty() {
                        return Resolved::Unqualified;
                    }
                    return Resolved::Namespace(uri);
                }
            }
        }
        match prefix {
            Some(_) => Resolved::Unbound,
            None => Resolved::Unqualified,
        }
    }

    /// Unprefixed attributes are never in a namespace.
    pub(crate) fn resolve_attribute(&self, prefix: Option<&str>) -> Resolved<'_> {
        match prefix {
            None => Resolved::Unqualified,
            Some(_) => self.resolve_element(prefix),
        }
    }
}

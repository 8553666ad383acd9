//! Error types shared by the codec, the registry and the connection engines.

use std::time::Duration;

use thiserror::Error;

use crate::element::Element;

/// Stream decoding or encoding failure.
///
/// Decoding failures are fatal. Once a codec has returned one it refuses
/// further input: XML streams cannot be resynchronised mid-document, so the
/// transport has to be closed. An encoding failure only affects the element
/// being written.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("stream is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("mismatched end tag: expected </{expected}>, found </{found}>")]
    MismatchedEndTag { expected: String, found: String },

    #[error("end tag </{0}> without a matching start tag")]
    UnexpectedEndTag(String),

    #[error("stanza exceeds the {limit} byte limit")]
    StanzaTooLarge { limit: usize },

    #[error("codec already failed and cannot accept more input")]
    Poisoned,

    #[error("cannot serialize XML name {0:?}")]
    InvalidName(String),
}

/// Malformed JID text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("JID has an empty domain")]
    EmptyDomain,
    #[error("JID has an empty localpart")]
    EmptyNode,
    #[error("JID has an empty resource")]
    EmptyResource,
}

/// Error returned by client and server operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("state conflict: connection is {current} but must be one of {expected:?}")]
    StateConflict {
        current: &'static str,
        expected: Vec<&'static str>,
    },

    #[error("authentication failed: {reason}")]
    Auth {
        reason: String,
        stanza: Option<Element>,
    },

    #[error("protocol error: {reason}")]
    Protocol {
        reason: String,
        stanza: Option<Element>,
    },

    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("DNS resolution failed: {0}")]
    Resolve(String),
}

impl EngineError {
    pub(crate) fn auth(reason: impl Into<String>, stanza: Option<&Element>) -> Self {
        Self::Auth {
            reason: reason.into(),
            stanza: stanza.cloned(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>, stanza: Option<&Element>) -> Self {
        Self::Protocol {
            reason: reason.into(),
            stanza: stanza.cloned(),
        }
    }

    /// The stanza that triggered an auth or protocol failure, if any.
    pub fn stanza(&self) -> Option<&Element> {
        match self {
            Self::Auth { stanza, .. } | Self::Protocol { stanza, .. } => stanza.as_ref(),
            _ => None,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

//! Concurrent publish/subscribe registry keyed by stanza identity.
//!
//! Handlers are registered against a [`DispatchKey`] (qualified name,
//! namespace, optional action) and receive every payload published under
//! exactly that key. The registry is shared by every connection of a client
//! or server; per-connection registrations are tracked with a
//! [`RegistrationSet`] so they can be dropped in one pass at teardown.

use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::{debug, error};

use crate::element::Element;
use crate::stream::{StreamEvent, NS_STREAMS, STREAM_ELEMENT};

pub type HandlerError = Box<dyn Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler<P> = Arc<dyn Fn(&P) -> HandlerResult + Send + Sync>;

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Namespace component of a [`DispatchKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NamespaceMatch {
    Exact(String),
    /// Element that carries no namespace.
    Unqualified,
    /// Explicit catch-all key. Only receives payloads published under it,
    /// which stanza delivery does alongside the exact key.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    name: String,
    namespace: NamespaceMatch,
    action: Option<String>,
}

impl DispatchKey {
    pub fn new(name: impl Into<String>, namespace: NamespaceMatch) -> Self {
        Self {
            name: name.into(),
            namespace,
            action: None,
        }
    }

    pub fn stanza(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::new(name, NamespaceMatch::Exact(namespace.into()))
    }

    pub fn any_namespace(name: impl Into<String>) -> Self {
        Self::new(name, NamespaceMatch::Any)
    }

    /// Exact key for a decoded element.
    pub fn for_element(element: &Element) -> Self {
        let namespace = match element.namespace() {
            Some(ns) if !ns.is_empty() => NamespaceMatch::Exact(ns.to_owned()),
            _ => NamespaceMatch::Unqualified,
        };
        Self::new(element.name(), namespace)
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn stream_start() -> Self {
        Self::stanza(STREAM_ELEMENT, NS_STREAMS).with_action("start")
    }

    pub fn stream_end() -> Self {
        Self::stanza(STREAM_ELEMENT, NS_STREAMS).with_action("end")
    }

    pub fn connected() -> Self {
        Self::new("connection", NamespaceMatch::Unqualified).with_action("start")
    }

    pub fn disconnected() -> Self {
        Self::new("connection", NamespaceMatch::Unqualified).with_action("end")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &NamespaceMatch {
        &self.namespace
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            NamespaceMatch::Exact(ns) => write!(f, "{{{}}}{}", ns, self.name)?,
            NamespaceMatch::Unqualified => f.write_str(&self.name)?,
            NamespaceMatch::Any => write!(f, "{{*}}{}", self.name)?,
        }
        if let Some(action) = &self.action {
            write!(f, "#{action}")?;
        }
        Ok(())
    }
}

/// What a connection delivers to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Connected,
    Disconnected,
    Stream(StreamEvent),
}

impl Delivery {
    /// Keys this delivery is published under, in order. Stanzas go to their
    /// exact key first and then to the any-namespace key for their name.
    pub fn keys(&self) -> Vec<DispatchKey> {
        match self {
            Delivery::Connected => vec![DispatchKey::connected()],
            Delivery::Disconnected => vec![DispatchKey::disconnected()],
            Delivery::Stream(StreamEvent::StreamStart(_)) => vec![DispatchKey::stream_start()],
            Delivery::Stream(StreamEvent::StreamEnd) => vec![DispatchKey::stream_end()],
            Delivery::Stream(StreamEvent::Stanza(stanza)) => vec![
                DispatchKey::for_element(stanza),
                DispatchKey::any_namespace(stanza.name()),
            ],
        }
    }

    pub fn stanza(&self) -> Option<&Element> {
        match self {
            Delivery::Stream(StreamEvent::Stanza(stanza)) => Some(stanza),
            _ => None,
        }
    }
}

/// Handle returned by [`DispatchRegistry::register`].
#[derive(Debug, PartialEq, Eq)]
pub struct Registration {
    key: DispatchKey,
    id: u64,
}

impl Registration {
    pub fn key(&self) -> &DispatchKey {
        &self.key
    }
}

struct Entry<P> {
    id: u64,
    handler: Handler<P>,
}

pub struct DispatchRegistry<P> {
    handlers: DashMap<DispatchKey, Vec<Entry<P>>>,
    next_id: AtomicU64,
}

impl<P> Default for DispatchRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> DispatchRegistry<P> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register<F>(&self, key: DispatchKey, handler: F) -> Registration
    where
        F: Fn(&P) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, id, "Registering handler");
        self.handlers.entry(key.clone()).or_default().push(Entry {
            id,
            handler: Arc::new(handler),
        });
        Registration { key, id }
    }

    /// Remove a registration. Returns whether it was still registered;
    /// removing twice is a no-op.
    pub fn unregister(&self, registration: &Registration) -> bool {
        let removed = match self.handlers.get_mut(&registration.key) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|entry| entry.id != registration.id);
                entries.len() != before
            }
            None => false,
        };
        self.handlers
            .remove_if(&registration.key, |_, entries| entries.is_empty());
        removed
    }

    pub fn unregister_all(&self) {
        self.handlers.clear();
    }

    pub fn handler_count(&self, key: &DispatchKey) -> usize {
        self.handlers.get(key).map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver `payload` to every handler registered under `key` right now.
    ///
    /// Handlers run on the calling task after the map lock is released, so
    /// they may register, unregister or publish themselves. Errors and panics
    /// are logged and do not reach the publisher or the remaining handlers.
    /// Returns the number of handlers invoked.
    pub fn publish(&self, key: &DispatchKey, payload: &P) -> usize {
        let snapshot: Vec<Handler<P>> = match self.handlers.get(key) {
            Some(entries) => entries.iter().map(|e| e.handler.clone()).collect(),
            None => return 0,
        };

        for handler in &snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(key = %key, error = %e, "Error while executing handler"),
                Err(_) => error!(key = %key, "Handler panicked"),
            }
        }
        snapshot.len()
    }
}

/// Registrations owned by one connection or module.
#[derive(Debug, Default)]
pub struct RegistrationSet {
    registrations: Mutex<Vec<Registration>>,
}

impl RegistrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, registration: Registration) {
        lock(&self.registrations).push(registration);
    }

    pub fn len(&self) -> usize {
        lock(&self.registrations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister everything in the set and empty it.
    pub fn cancel_all<P>(&self, registry: &DispatchRegistry<P>) {
        let registrations = std::mem::take(&mut *lock(&self.registrations));
        for registration in &registrations {
            registry.unregister(registration);
        }
    }
}

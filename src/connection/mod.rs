//! Per-connection plumbing shared by the client and the server.
//!
//! Each connection is driven by one tokio task that owns the socket and the
//! codec. Everything else talks to it through an [`Outbox`]: sends, the
//! STARTTLS upgrade and the close all travel through one ordered queue, so
//! writes are serialized without a lock around the socket.

mod driver;
pub mod state;
pub mod tls;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub(crate) use driver::{run_stream, run_websocket};
pub use state::{ConnectionState, Lifecycle, StateCell};
pub(crate) use tls::TlsUpgrade;

use crate::error::EngineError;
use crate::stream::{Outbound, StreamEvent};

/// Monotonic connection id for correlating logs across tasks.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased transport, so a plain TCP stream can be swapped for its TLS
/// upgrade in place.
pub(crate) type BoxedIo = Box<dyn AsyncStream>;

#[derive(Debug)]
pub(crate) enum Command {
    Send(Outbound),
    StartTls,
    Close,
}

/// Sending half of a connection's command queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl Outbox {
    pub(crate) fn channel(conn_id: u64) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { conn_id, tx }, rx)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue a stanza or raw fragment for writing.
    pub fn send(&self, outbound: impl Into<Outbound>) -> Result<(), EngineError> {
        self.command(Command::Send(outbound.into()))
    }

    /// Ask the driver to close the stream.
    pub fn close(&self) -> Result<(), EngineError> {
        self.command(Command::Close)
    }

    pub(crate) fn command(&self, command: Command) -> Result<(), EngineError> {
        self.tx
            .send(command)
            .map_err(|_| EngineError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Callbacks from the driver task into the protocol layer. All of them run on
/// the driver task, in stream order.
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    fn on_event(&self, event: StreamEvent);

    /// Outcome of a `Command::StartTls`.
    fn on_tls(&self, result: Result<(), EngineError>);

    /// The connection is gone. `cause` is `None` for an orderly close.
    fn on_closed(&self, cause: Option<EngineError>);
}

#[derive(Debug, Clone)]
pub(crate) struct DriverConfig {
    pub read_buffer_size: usize,
    pub max_stanza_size: usize,
    /// How long to wait for the peer's `</stream:stream>` after sending ours.
    pub close_timeout: Duration,
}

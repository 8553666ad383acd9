//! The task that owns a connection's socket.
//!
//! One loop per connection polls, in priority order, the command queue, the
//! socket and the close deadline. Decoded events are handed to the
//! [`ConnectionHandler`] on this task, so stanza order is preserved end to
//! end.

use std::io;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};

use super::{BoxedIo, Command, ConnectionHandler, DriverConfig, TlsUpgrade};
use crate::error::EngineError;
use crate::stream::{Outbound, StanzaCodec, StreamEvent, WebSocketFraming, STREAM_CLOSE};

enum Flow {
    Continue,
    Stop(Option<EngineError>),
}

/// Resolves when the close deadline passes, never if there is none.
async fn close_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_some(io: &mut Option<BoxedIo>, buf: &mut [u8]) -> io::Result<usize> {
    match io {
        Some(stream) => stream.read(buf).await,
        // Transport lost to a failed TLS upgrade; only commands can end the loop.
        None => std::future::pending().await,
    }
}

struct StreamDriver<H> {
    conn_id: u64,
    io: Option<BoxedIo>,
    codec: StanzaCodec,
    handler: Arc<H>,
    tls: TlsUpgrade,
    config: DriverConfig,
    close_sent: bool,
    peer_closed: bool,
    deadline: Option<Instant>,
}

impl<H: ConnectionHandler> StreamDriver<H> {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.io.as_mut() {
            Some(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport unavailable",
            )),
        }
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Send(outbound) => {
                if self.close_sent {
                    debug!(conn_id = self.conn_id, "Dropping write after stream close");
                    return Flow::Continue;
                }
                if self.io.is_none() {
                    warn!(conn_id = self.conn_id, "Dropping write, transport unavailable");
                    return Flow::Continue;
                }
                let bytes = match self.codec.encode(outbound) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(conn_id = self.conn_id, error = %e, "Dropping stanza that failed to encode");
                        return Flow::Continue;
                    }
                };
                trace!(conn_id = self.conn_id, data = %String::from_utf8_lossy(&bytes), "SEND");
                match self.write(&bytes).await {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        error!(conn_id = self.conn_id, error = %e, "Write failed");
                        Flow::Stop(Some(e.into()))
                    }
                }
            }
            Command::StartTls => {
                let Some(plain) = self.io.take() else {
                    self.handler.on_tls(Err(EngineError::ConnectionClosed));
                    return Flow::Continue;
                };
                match self.tls.upgrade(plain).await {
                    Ok(secured) => {
                        self.io = Some(secured);
                        // The secured stream starts over at byte zero.
                        self.codec = StanzaCodec::with_max_stanza_size(self.config.max_stanza_size);
                        info!(conn_id = self.conn_id, "Stream secured");
                        self.handler.on_tls(Ok(()));
                    }
                    Err(e) => {
                        warn!(conn_id = self.conn_id, error = %e, "STARTTLS failed, waiting for close");
                        self.handler.on_tls(Err(e));
                    }
                }
                Flow::Continue
            }
            Command::Close => {
                if self.close_sent {
                    return Flow::Continue;
                }
                self.close_sent = true;
                if self.io.is_none() {
                    return Flow::Stop(None);
                }
                if let Err(e) = self.write(STREAM_CLOSE.as_bytes()).await {
                    debug!(conn_id = self.conn_id, error = %e, "Stream close write failed");
                    return Flow::Stop(None);
                }
                if self.peer_closed {
                    return Flow::Stop(None);
                }
                self.deadline = Some(Instant::now() + self.config.close_timeout);
                Flow::Continue
            }
        }
    }

    fn on_read(&mut self, result: io::Result<usize>, buf: &[u8]) -> Flow {
        let n = match result {
            Ok(0) => {
                info!(conn_id = self.conn_id, "Connection closed by peer");
                return if self.close_sent || self.peer_closed {
                    Flow::Stop(None)
                } else {
                    Flow::Stop(Some(EngineError::ConnectionClosed))
                };
            }
            Ok(n) => n,
            Err(e) if self.close_sent => {
                debug!(conn_id = self.conn_id, error = %e, "Read error while closing");
                return Flow::Stop(None);
            }
            Err(e) => {
                error!(conn_id = self.conn_id, error = %e, "Read error");
                return Flow::Stop(Some(e.into()));
            }
        };

        trace!(conn_id = self.conn_id, bytes = n, "RECV");
        let events = match self.codec.feed(&buf[..n]) {
            Ok(events) => events,
            Err(e) => {
                error!(conn_id = self.conn_id, error = %e, "Stream decode failed");
                return Flow::Stop(Some(e.into()));
            }
        };
        deliver(self.conn_id, &*self.handler, events, &mut self.peer_closed);

        if self.close_sent && self.peer_closed {
            Flow::Stop(None)
        } else {
            Flow::Continue
        }
    }
}

fn deliver<H: ConnectionHandler>(
    conn_id: u64,
    handler: &H,
    events: Vec<StreamEvent>,
    peer_closed: &mut bool,
) {
    for event in events {
        if matches!(event, StreamEvent::StreamEnd) {
            debug!(conn_id, "Peer closed stream");
            *peer_closed = true;
        }
        handler.on_event(event);
    }
}

/// Drive a TCP (or TLS-upgraded) connection until it closes.
pub(crate) async fn run_stream<H: ConnectionHandler>(
    conn_id: u64,
    io: BoxedIo,
    mut commands: mpsc::UnboundedReceiver<Command>,
    handler: Arc<H>,
    tls: TlsUpgrade,
    config: DriverConfig,
) {
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    let mut driver = StreamDriver {
        conn_id,
        io: Some(io),
        codec: StanzaCodec::with_max_stanza_size(config.max_stanza_size),
        handler,
        tls,
        config,
        close_sent: false,
        peer_closed: false,
        deadline: None,
    };
    let mut commands_open = true;

    let cause = loop {
        let flow = tokio::select! {
            biased;

            command = commands.recv(), if commands_open => {
                let command = match command {
                    Some(command) => command,
                    None => {
                        // Every outbox is gone; nobody can close us explicitly.
                        commands_open = false;
                        Command::Close
                    }
                };
                driver.on_command(command).await
            }
            result = read_some(&mut driver.io, &mut buf) => driver.on_read(result, &buf),
            _ = close_deadline(driver.deadline) => {
                warn!(conn_id, "Peer did not close the stream in time");
                Flow::Stop(None)
            }
        };
        if let Flow::Stop(cause) = flow {
            break cause;
        }
    };

    if let Some(mut stream) = driver.io.take() {
        let _ = timeout(driver.config.close_timeout, stream.shutdown()).await;
    }
    info!(conn_id, cause = ?cause, "Connection ended");
    driver.handler.on_closed(cause);
}

/// Drive an RFC 7395 WebSocket connection until it closes.
pub(crate) async fn run_websocket<S, H>(
    conn_id: u64,
    ws: WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    handler: Arc<H>,
    config: DriverConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: ConnectionHandler,
{
    let (mut sink, mut frames) = ws.split();
    let mut framing = WebSocketFraming::new(config.max_stanza_size);
    let mut close_sent = false;
    let mut peer_closed = false;
    let mut deadline: Option<Instant> = None;
    let mut commands_open = true;

    let cause = loop {
        tokio::select! {
            biased;

            command = commands.recv(), if commands_open => {
                let command = match command {
                    Some(command) => command,
                    None => {
                        commands_open = false;
                        Command::Close
                    }
                };
                let outbound = match command {
                    Command::Send(_) if close_sent => {
                        debug!(conn_id, "Dropping write after stream close");
                        continue;
                    }
                    Command::Send(outbound) => outbound,
                    Command::StartTls => {
                        handler.on_tls(Err(EngineError::Tls(
                            "STARTTLS is not available on WebSocket connections".to_string(),
                        )));
                        continue;
                    }
                    Command::Close if close_sent => continue,
                    Command::Close => {
                        close_sent = true;
                        Outbound::from(STREAM_CLOSE)
                    }
                };
                let frame = match framing.encode(outbound) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(conn_id, error = %e, "Dropping stanza that failed to encode");
                        continue;
                    }
                };
                trace!(conn_id, data = %frame, "SEND");
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    if close_sent {
                        break None;
                    }
                    error!(conn_id, error = %e, "WebSocket write failed");
                    break Some(EngineError::Transport(io::Error::other(e)));
                }
                if close_sent {
                    if peer_closed {
                        break None;
                    }
                    deadline.get_or_insert_with(|| Instant::now() + config.close_timeout);
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    trace!(conn_id, data = %text, "RECV");
                    match framing.decode(&text) {
                        Ok(events) => deliver(conn_id, &*handler, events, &mut peer_closed),
                        Err(e) => {
                            error!(conn_id, error = %e, "Frame decode failed");
                            break Some(e.into());
                        }
                    }
                    if close_sent && peer_closed {
                        break None;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(conn_id, "WebSocket closed by peer");
                    if close_sent || peer_closed {
                        break None;
                    }
                    break Some(EngineError::ConnectionClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if close_sent {
                        break None;
                    }
                    error!(conn_id, error = %e, "WebSocket read error");
                    break Some(EngineError::Transport(io::Error::other(e)));
                }
            },
            _ = close_deadline(deadline) => {
                warn!(conn_id, "Peer did not close the stream in time");
                break None;
            }
        }
    };

    let _ = timeout(config.close_timeout, sink.close()).await;
    info!(conn_id, cause = ?cause, "Connection ended");
    handler.on_closed(cause);
}

//! The connection pump.
//!
//! One socket is split into a read half and a write half. The read loop
//! decodes frames into the inbound queue; the write loop drains the outbound
//! queue onto the socket. The loops never touch each other's half and only
//! coordinate through [`PumpSignals`]. When a loop exits it hands its half
//! back in its exit value so the supervisor can close the socket exactly once.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, json, EventWrapper, ProtocolError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, trace, warn};

use crate::metrics;
use crate::signal::PumpSignals;
use crate::traits::TransportError;

/// Write half of a pumped socket.
pub type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// Read half of a pumped socket.
pub type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// How events are encoded on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Length-prefixed MessagePack in binary messages (hub links).
    Binary,
    /// JSON objects in text messages (peer links).
    Json,
}

impl WireFormat {
    /// Encode an event as a WebSocket message.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be framed.
    pub fn prepare(&self, event: &EventWrapper) -> Result<Message, ProtocolError> {
        match self {
            WireFormat::Binary => Ok(Message::Binary(codec::prepare(event)?.to_vec())),
            WireFormat::Json => Ok(Message::Text(json::prepare_json(event)?)),
        }
    }

    /// Decode a WebSocket message.
    ///
    /// Returns `None` if the message is not of this format's kind.
    #[must_use]
    pub fn parse(&self, message: &Message) -> Option<Result<EventWrapper, ProtocolError>> {
        match (self, message) {
            (WireFormat::Binary, Message::Binary(data)) => Some(codec::parse(data)),
            (WireFormat::Json, Message::Text(text)) => Some(json::parse_json(text)),
            _ => None,
        }
    }
}

/// What an expired read deadline means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlinePolicy {
    /// No heartbeat arrived in the window: the link is dead.
    Fatal,
    /// The deadline is only a wake-up to check whether the pump was stopped.
    PollStop,
}

/// Read loop settings.
#[derive(Debug, Clone)]
pub struct ReadConfig {
    /// Connection id, for logs.
    pub connection: String,
    /// Read deadline window, re-armed before every read.
    pub keepalive: Duration,
    pub deadline: DeadlinePolicy,
    pub format: WireFormat,
}

/// Why the read loop exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The peer closed the connection.
    ClosedByPeer,
    /// The read deadline expired under [`DeadlinePolicy::Fatal`].
    Timeout,
    /// Any other transport failure.
    Failed(String),
    /// The supervisor asked the pump to stop.
    Stopped,
    /// Nobody reads the inbound queue anymore.
    ConsumerGone,
}

/// Value returned by a finished read loop.
pub struct ReadExit<S> {
    pub stream: WsSource<S>,
    pub outcome: ReadOutcome,
    /// When the last heartbeat probe arrived.
    pub last_ping: Option<Instant>,
}

/// Write loop settings.
#[derive(Debug, Clone)]
pub struct WriteConfig {
    /// Connection id, for logs.
    pub connection: String,
    /// Deadline for every single write.
    pub write_wait: Duration,
    pub format: WireFormat,
}

/// Why the write loop exited.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The outbound queue was closed; a normal-closure frame was sent.
    QueueClosed,
    /// The read loop exited first.
    PeerGone,
    /// The supervisor asked the pump to stop.
    Stopped,
    /// Writing to the socket failed.
    Failed(TransportError),
}

/// Value returned by a finished write loop.
pub struct WriteExit<S> {
    pub sink: WsSink<S>,
    /// The outbound queue, handed back for the next pump generation.
    pub outbound: mpsc::Receiver<EventWrapper>,
    pub outcome: WriteOutcome,
}

/// Read frames until the socket fails, the peer leaves, or the pump is stopped.
///
/// Malformed frames and frames of the wrong kind are dropped without ending
/// the loop. Heartbeat probes are answered by the WebSocket layer on the next
/// read; the loop records them and re-arms the deadline.
pub async fn read_loop<S>(
    mut stream: WsSource<S>,
    inbound: mpsc::Sender<EventWrapper>,
    signals: PumpSignals,
    config: ReadConfig,
) -> ReadExit<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn = &config.connection;
    let mut last_ping = None;

    let outcome = loop {
        let deadline = Instant::now() + config.keepalive;

        let message = match timeout_at(deadline, stream.next()).await {
            Err(_) => match config.deadline {
                DeadlinePolicy::Fatal => {
                    warn!(connection = %conn, "No heartbeat inside the keepalive window");
                    break ReadOutcome::Timeout;
                }
                DeadlinePolicy::PollStop => {
                    if signals.stop.is_cancelled() {
                        break ReadOutcome::Stopped;
                    }
                    continue;
                }
            },
            Ok(None) => {
                debug!(connection = %conn, "WebSocket stream ended");
                break ReadOutcome::ClosedByPeer;
            }
            Ok(Some(Err(e))) => break classify_read_error(conn, e),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Ping(_) => {
                trace!(connection = %conn, "Ping");
                last_ping = Some(Instant::now());
            }
            Message::Pong(_) => {}
            Message::Close(frame) => {
                debug!(connection = %conn, frame = ?frame, "Received close frame");
                break ReadOutcome::ClosedByPeer;
            }
            other => match config.format.parse(&other) {
                Some(Ok(event)) => {
                    let size = event.payload.len();
                    let delivered = tokio::select! {
                        biased;
                        sent = inbound.send(event) => Some(sent.is_ok()),
                        _ = signals.stop.cancelled() => None,
                    };
                    match delivered {
                        Some(true) => metrics::record_event(size, "inbound"),
                        Some(false) => break ReadOutcome::ConsumerGone,
                        None => break ReadOutcome::Stopped,
                    }
                }
                Some(Err(e)) => {
                    warn!(connection = %conn, error = %e, "Poorly formed message, dropping");
                    metrics::record_dropped_frame("malformed");
                }
                None => {
                    warn!(connection = %conn, kind = message_kind(&other), "Unexpected message kind, dropping");
                    metrics::record_dropped_frame("unexpected_kind");
                }
            },
        }
    };

    debug!(connection = %conn, outcome = ?outcome, "Read loop exiting");
    signals.read_done.cancel();

    ReadExit {
        stream,
        outcome,
        last_ping,
    }
}

/// Drain the outbound queue onto the socket.
///
/// Exits when the queue is closed (after sending a normal-closure frame),
/// when the read loop has exited, when stopped, or on the first failed write.
pub async fn write_loop<S>(
    mut sink: WsSink<S>,
    mut outbound: mpsc::Receiver<EventWrapper>,
    signals: PumpSignals,
    config: WriteConfig,
) -> WriteExit<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    enum Next {
        Stop,
        PeerGone,
        Item(Option<EventWrapper>),
    }

    let conn = &config.connection;

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = signals.stop.cancelled() => Next::Stop,
            _ = signals.read_done.cancelled() => Next::PeerGone,
            item = outbound.recv() => Next::Item(item),
        };

        let event = match next {
            Next::Stop => break WriteOutcome::Stopped,
            Next::PeerGone => break WriteOutcome::PeerGone,
            Next::Item(None) => {
                send_close(&mut sink, conn, config.write_wait).await;
                break WriteOutcome::QueueClosed;
            }
            Next::Item(Some(event)) => event,
        };

        let message = match config.format.prepare(&event) {
            Ok(message) => message,
            Err(e) => {
                error!(connection = %conn, room = %event.room, error = %e, "Cannot frame event, dropping");
                continue;
            }
        };

        match timeout(config.write_wait, sink.send(message)).await {
            Ok(Ok(())) => metrics::record_event(event.payload.len(), "outbound"),
            Ok(Err(e)) => {
                error!(connection = %conn, error = %e, "Problem writing message to socket");
                break WriteOutcome::Failed(TransportError::WriteFailed(e.to_string()));
            }
            Err(_) => {
                error!(connection = %conn, "Write deadline exceeded");
                break WriteOutcome::Failed(TransportError::WriteTimeout);
            }
        }
    };

    debug!(connection = %conn, outcome = ?outcome, "Write loop exiting");
    signals.write_done.cancel();

    WriteExit {
        sink,
        outbound,
        outcome,
    }
}

/// Close the socket through its write half.
///
/// Errors are expected here (the socket is usually already broken) and only
/// logged.
pub async fn close_sink<S>(sink: &mut WsSink<S>, connection: &str, write_wait: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(write_wait, sink.close()).await {
        Ok(Ok(())) => debug!(connection = %connection, "Socket closed"),
        Ok(Err(e)) => debug!(connection = %connection, error = %e, "Socket close reported an error"),
        Err(_) => debug!(connection = %connection, "Socket close timed out"),
    }
}

async fn send_close<S>(sink: &mut WsSink<S>, connection: &str, write_wait: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    match timeout(write_wait, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => debug!(connection = %connection, "Sent normal closure"),
        Ok(Err(e)) => debug!(connection = %connection, error = %e, "Failed to send close frame"),
        Err(_) => debug!(connection = %connection, "Close frame timed out"),
    }
}

fn classify_read_error(connection: &str, e: WsError) -> ReadOutcome {
    match e {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
            warn!(connection = %connection, error = %e, "Websocket closing");
            ReadOutcome::ClosedByPeer
        }
        WsError::Io(ref io) if io.kind() == std::io::ErrorKind::TimedOut => {
            warn!(connection = %connection, error = %e, "Socket read timed out");
            ReadOutcome::Timeout
        }
        other => {
            error!(connection = %connection, error = %other, "Socket read failed");
            ReadOutcome::Failed(other.to_string())
        }
    }
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

//! Short-lived peer links with an inactivity timeout.
//!
//! A [`PeerLink`] carries events between this node and the repeater endpoint
//! of one device. It never reconnects: once both directions have been quiet
//! for a TTL, or either loop fails, the link unregisters itself and goes
//! away. Its owner re-creates it on demand.

use futures_util::StreamExt;
use relay_core::ConnectionRegistry;
use relay_protocol::EventWrapper;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::hub::{DEFAULT_QUEUE_CAPACITY, WRITE_WAIT};
use crate::metrics;
use crate::pump::{close_sink, read_loop, write_loop, DeadlinePolicy, ReadConfig, WireFormat, WriteConfig};
use crate::signal::PumpSignals;
use crate::state::ConnectionState;
use crate::traits::{Dialer, TransportError};
use crate::websocket::{peer_url, REPEATER_PORT};

/// Inactivity window after which a link closes.
pub const TTL: Duration = Duration::from_secs(5);

/// Floor for `ttl`; the liveness tick cannot run on a zero period.
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// Peer link settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Inactivity window; also the liveness tick period and the close grace.
    pub ttl: Duration,
    /// Port of the device's repeater endpoint.
    pub port: u16,
    /// Capacity of the send queue and the internal queues.
    pub queue_capacity: usize,
    /// Write deadline window.
    pub write_wait: Duration,
}

impl PeerConfig {
    /// Clamp values that would panic: a zero queue capacity and a TTL under
    /// [`MIN_TTL`].
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.queue_capacity == 0 {
            warn!("Peer queue_capacity of 0 raised to 1");
            self.queue_capacity = 1;
        }
        if self.ttl < MIN_TTL {
            warn!(requested = ?self.ttl, "Peer ttl raised to {:?}", MIN_TTL);
            self.ttl = MIN_TTL;
        }
        self
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ttl: TTL,
            port: REPEATER_PORT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_wait: WRITE_WAIT,
        }
    }
}

/// Why a peer link closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkExit {
    /// Both directions were quiet for a TTL.
    Idle,
    /// The read loop failed or the peer hung up.
    ReadFailed,
    /// The write loop failed.
    WriteFailed,
    /// Every sender of the send queue was dropped.
    OwnerClosed,
    /// The receive queue's consumer is gone.
    ReceiverGone,
    /// The supervisor task itself died.
    Aborted,
}

impl LinkExit {
    /// Get the reason name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkExit::Idle => "idle",
            LinkExit::ReadFailed => "read_failed",
            LinkExit::WriteFailed => "write_failed",
            LinkExit::OwnerClosed => "owner_closed",
            LinkExit::ReceiverGone => "receiver_gone",
            LinkExit::Aborted => "aborted",
        }
    }
}

/// The send side of a link, created ahead of the link itself.
///
/// Lets an owner publish the sender (e.g. register it for routing) before
/// the dial completes.
#[derive(Debug)]
pub struct SendQueue {
    sender: mpsc::Sender<EventWrapper>,
    receiver: mpsc::Receiver<EventWrapper>,
}

impl SendQueue {
    /// Create a queue; a zero `capacity` is raised to 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self { sender, receiver }
    }

    /// Get a handle for pushing events into the queue.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<EventWrapper> {
        self.sender.clone()
    }
}

/// A link to one device's repeater endpoint.
pub struct PeerLink {
    id: String,
    room: String,
    sender: mpsc::Sender<EventWrapper>,
    state: watch::Receiver<ConnectionState>,
    supervisor: JoinHandle<LinkExit>,
    exit: Option<LinkExit>,
}

impl PeerLink {
    /// Dial the device at `device_addr` and start the link.
    ///
    /// Events read from the device go to `receive`. When the link dies it
    /// calls `registry.unregister_connection(id)`.
    ///
    /// # Errors
    ///
    /// Returns the dial error; nothing is started in that case.
    pub async fn connect<D: Dialer>(
        id: impl Into<String>,
        room: impl Into<String>,
        device_addr: &str,
        dialer: &D,
        receive: mpsc::Sender<EventWrapper>,
        registry: Arc<dyn ConnectionRegistry>,
        config: PeerConfig,
    ) -> Result<Self, TransportError> {
        let queue = SendQueue::new(config.queue_capacity);
        Self::connect_queued(id, room, device_addr, dialer, queue, receive, registry, config).await
    }

    /// Like [`PeerLink::connect`], but drains a queue created before the dial.
    ///
    /// Events pushed into `queue` while the dial is in flight are written
    /// once the link is up. On a dial error they are dropped with it.
    ///
    /// # Errors
    ///
    /// Returns the dial error; nothing is started in that case.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect_queued<D: Dialer>(
        id: impl Into<String>,
        room: impl Into<String>,
        device_addr: &str,
        dialer: &D,
        queue: SendQueue,
        receive: mpsc::Sender<EventWrapper>,
        registry: Arc<dyn ConnectionRegistry>,
        config: PeerConfig,
    ) -> Result<Self, TransportError> {
        let id = id.into();
        let url = peer_url(device_addr, config.port);
        debug!(connection = %id, url = %url, "Starting connection");

        let socket = dialer.dial(&url).await.map_err(|e| {
            error!(connection = %id, error = %e, "Couldn't initialize peer link");
            metrics::record_connect_failure();
            e
        })?;
        debug!(connection = %id, url = %url, "Connection started");

        Ok(Self::start(id, room.into(), socket, queue, receive, registry, config))
    }

    /// Start a link over an already-open socket, e.g. one a device dialed in on.
    #[must_use]
    pub fn from_socket<S>(
        id: impl Into<String>,
        room: impl Into<String>,
        socket: WebSocketStream<S>,
        receive: mpsc::Sender<EventWrapper>,
        registry: Arc<dyn ConnectionRegistry>,
        config: PeerConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let queue = SendQueue::new(config.queue_capacity);
        Self::start(id.into(), room.into(), socket, queue, receive, registry, config)
    }

    fn start<S>(
        id: String,
        room: String,
        socket: WebSocketStream<S>,
        queue: SendQueue,
        receive: mpsc::Sender<EventWrapper>,
        registry: Arc<dyn ConnectionRegistry>,
        config: PeerConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = config.sanitized();
        let SendQueue { sender, receiver: send } = queue;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Active);

        let supervisor = LivenessSupervisor {
            id: id.clone(),
            config,
            send,
            receive,
            registry,
            state: state_tx,
        };
        metrics::record_link_opened();
        let supervisor = tokio::spawn(supervisor.run(socket));

        Self {
            id,
            room,
            sender,
            state: state_rx,
            supervisor,
            exit: None,
        }
    }

    /// Queue an event for the device.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the link has closed.
    pub async fn send_event(&self, event: EventWrapper) -> Result<(), TransportError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Get a handle for queueing events from other tasks.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<EventWrapper> {
        self.sender.clone()
    }

    /// Get the current link state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the link has closed (or is closing).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Down
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the room this link serves.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Wait for the link to close and report why.
    pub async fn closed(&mut self) -> LinkExit {
        if let Some(exit) = self.exit {
            return exit;
        }
        let exit = (&mut self.supervisor).await.unwrap_or(LinkExit::Aborted);
        self.exit = Some(exit);
        exit
    }
}

struct LivenessSupervisor {
    id: String,
    config: PeerConfig,
    /// External send queue.
    send: mpsc::Receiver<EventWrapper>,
    /// External receive queue.
    receive: mpsc::Sender<EventWrapper>,
    registry: Arc<dyn ConnectionRegistry>,
    state: watch::Sender<ConnectionState>,
}

impl LivenessSupervisor {
    async fn run<S>(mut self, socket: WebSocketStream<S>) -> LinkExit
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let (inbound_tx, mut inbound) = mpsc::channel(self.config.queue_capacity);
        let (outbound, outbound_rx) = mpsc::channel(self.config.queue_capacity);
        let signals = PumpSignals::new();

        let reader = tokio::spawn(read_loop(
            stream,
            inbound_tx,
            signals.clone(),
            ReadConfig {
                connection: self.id.clone(),
                keepalive: self.config.ttl,
                deadline: DeadlinePolicy::PollStop,
                format: WireFormat::Json,
            },
        ));
        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            signals.clone(),
            WriteConfig {
                connection: self.id.clone(),
                write_wait: self.config.write_wait,
                format: WireFormat::Json,
            },
        ));

        let exit = self.pump(&signals, &outbound, &mut inbound).await;
        info!(connection = %self.id, reason = exit.as_str(), "Closing peer link");

        self.registry.unregister_connection(&self.id);
        self.state.send_replace(ConnectionState::Down);
        signals.stop.cancel();
        drop(outbound);

        // Grace window for in-flight writes.
        tokio::time::sleep(self.config.ttl).await;

        match writer.await {
            Ok(mut done) => close_sink(&mut done.sink, &self.id, self.config.write_wait).await,
            Err(e) => error!(connection = %self.id, error = %e, "Write loop aborted"),
        }
        match reader.await {
            Ok(done) => debug!(connection = %self.id, outcome = ?done.outcome, "Read loop closed"),
            Err(e) => error!(connection = %self.id, error = %e, "Read loop aborted"),
        }

        metrics::record_link_closed(exit.as_str());
        exit
    }

    /// Bridge the external queues to the pump until the link should close.
    async fn pump(
        &mut self,
        signals: &PumpSignals,
        outbound: &mpsc::Sender<EventWrapper>,
        inbound: &mut mpsc::Receiver<EventWrapper>,
    ) -> LinkExit {
        let ttl = self.config.ttl;
        let start = Instant::now();
        let mut read_deadline = start + ttl;
        let mut write_deadline = start + ttl;

        let mut ticker = tokio::time::interval_at(start + ttl, ttl);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if now >= read_deadline && now >= write_deadline {
                        return LinkExit::Idle;
                    }
                }
                _ = signals.read_done.cancelled() => return LinkExit::ReadFailed,
                _ = signals.write_done.cancelled() => return LinkExit::WriteFailed,
                event = self.send.recv() => {
                    let Some(event) = event else {
                        return LinkExit::OwnerClosed;
                    };
                    write_deadline = Instant::now() + ttl;
                    let sent = tokio::select! {
                        biased;
                        _ = signals.either_done() => false,
                        sent = outbound.send(event) => sent.is_ok(),
                    };
                    if !sent {
                        return loop_failure(signals);
                    }
                }
                event = inbound.recv() => {
                    let Some(event) = event else {
                        return LinkExit::ReadFailed;
                    };
                    read_deadline = Instant::now() + ttl;
                    let forwarded = tokio::select! {
                        biased;
                        _ = signals.either_done() => None,
                        sent = self.receive.send(event) => Some(sent.is_ok()),
                    };
                    match forwarded {
                        Some(true) => {}
                        Some(false) => return LinkExit::ReceiverGone,
                        None => return loop_failure(signals),
                    }
                }
            }
        }
    }
}

fn loop_failure(signals: &PumpSignals) -> LinkExit {
    if signals.read_done.is_cancelled() {
        LinkExit::ReadFailed
    } else {
        LinkExit::WriteFailed
    }
}

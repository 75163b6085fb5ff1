//! Hub link with infinite retry.
//!
//! A [`HubConnection`] keeps one long-lived connection to the hub. Its
//! supervisor runs one pump generation at a time: it waits for the write loop
//! to hand the failure over, closes the socket, waits for the read loop, then
//! redials every `retry_interval` until the hub answers. Because a single task
//! owns that cycle, at most one reconnect is ever in flight.
//!
//! The event queues outlive every generation, so callers keep sending and
//! reading across reconnects.

use futures_util::StreamExt;
use relay_protocol::EventWrapper;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::pump::{
    close_sink, read_loop, write_loop, DeadlinePolicy, ReadConfig, WireFormat, WriteConfig,
    WriteOutcome,
};
use crate::signal::PumpSignals;
use crate::state::ConnectionState;
use crate::traits::{Dialer, TransportError};
use crate::websocket::hub_url;

/// Wait between reconnect attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Keepalive window: the hub pings well inside it.
pub const PING_WAIT: Duration = Duration::from_secs(60);

/// Deadline for a single write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Default capacity of each event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Floor for `retry_interval`, so a flapping hub is never redialed in a tight loop.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Hub link settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the inbound and outbound queues.
    pub queue_capacity: usize,
    /// Wait between reconnect attempts.
    pub retry_interval: Duration,
    /// Read deadline window.
    pub ping_wait: Duration,
    /// Write deadline window.
    pub write_wait: Duration,
}

impl HubConfig {
    /// Clamp values that would panic or spin: a zero queue capacity and a
    /// retry interval under [`MIN_RETRY_INTERVAL`].
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.queue_capacity == 0 {
            warn!("Hub queue_capacity of 0 raised to 1");
            self.queue_capacity = 1;
        }
        if self.retry_interval < MIN_RETRY_INTERVAL {
            warn!(requested = ?self.retry_interval, "Hub retry_interval raised to {:?}", MIN_RETRY_INTERVAL);
            self.retry_interval = MIN_RETRY_INTERVAL;
        }
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_interval: RETRY_INTERVAL,
            ping_wait: PING_WAIT,
            write_wait: WRITE_WAIT,
        }
    }
}

/// Queue ends and state the supervisor takes over on `connect`.
struct SupervisorParts {
    outbound: mpsc::Receiver<EventWrapper>,
    inbound: mpsc::Sender<EventWrapper>,
    state: watch::Sender<ConnectionState>,
}

/// A self-healing connection to the hub.
pub struct HubConnection {
    id: String,
    connection_type: String,
    config: HubConfig,
    outbound: mpsc::Sender<EventWrapper>,
    inbound: mpsc::Receiver<EventWrapper>,
    state: watch::Receiver<ConnectionState>,
    parts: Option<SupervisorParts>,
    supervisor: Option<JoinHandle<()>>,
}

impl HubConnection {
    /// Create an unconnected hub link.
    #[must_use]
    pub fn new(id: impl Into<String>, connection_type: impl Into<String>, config: HubConfig) -> Self {
        let config = config.sanitized();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        Self {
            id: id.into(),
            connection_type: connection_type.into(),
            config,
            outbound: outbound_tx,
            inbound: inbound_rx,
            state: state_rx,
            parts: Some(SupervisorParts {
                outbound: outbound_rx,
                inbound: inbound_tx,
                state: state_tx,
            }),
            supervisor: None,
        }
    }

    /// Connect to the hub at `hub_addr` and start supervising the link.
    ///
    /// The supervisor is started whether or not the first dial succeeds; on
    /// failure it keeps retrying in the background.
    ///
    /// # Errors
    ///
    /// Returns the dial error if the first attempt failed (the link is then
    /// retrying), or [`TransportError::AlreadyStarted`] on a second call.
    pub async fn connect<D: Dialer>(&mut self, hub_addr: &str, dialer: D) -> Result<(), TransportError> {
        let parts = self.parts.take().ok_or(TransportError::AlreadyStarted)?;
        let url = hub_url(hub_addr, &self.connection_type);

        let supervisor = RetrySupervisor {
            id: self.id.clone(),
            url,
            dialer,
            config: self.config.clone(),
            outbound: Some(parts.outbound),
            inbound: parts.inbound,
            state: parts.state,
            last_dial: Some(Instant::now()),
        };

        match supervisor.dialer.dial(&supervisor.url).await {
            Ok(socket) => {
                info!(connection = %self.id, url = %supervisor.url, "Successfully connected to hub. Starting pumps...");
                self.supervisor = Some(tokio::spawn(supervisor.run(Some(socket))));
                Ok(())
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Opening connection to hub failed, retrying...");
                metrics::record_connect_failure();
                supervisor.set_state(ConnectionState::Retrying);
                self.supervisor = Some(tokio::spawn(supervisor.run(None)));
                Err(e)
            }
        }
    }

    /// Queue an event for the hub.
    ///
    /// Waits while the outbound queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the link is down for good.
    pub async fn send_event(&self, event: EventWrapper) -> Result<(), TransportError> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next event from the hub.
    ///
    /// Returns `None` once the link is down for good.
    pub async fn read_event(&mut self) -> Option<EventWrapper> {
        self.inbound.recv().await
    }

    /// Get a handle for queueing events from other tasks.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<EventWrapper> {
        self.outbound.clone()
    }

    /// Get the current link state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch link state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the connection type the hub knows this link by.
    #[must_use]
    pub fn connection_type(&self) -> &str {
        &self.connection_type
    }

    /// Whether the supervisor has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.supervisor.is_some()
    }
}

/// How one pump generation ended.
enum Generation {
    /// Transport failure: reconnect.
    Failed,
    /// The owner is gone: stop for good.
    Closed,
}

struct RetrySupervisor<D: Dialer> {
    id: String,
    url: String,
    dialer: D,
    config: HubConfig,
    /// Lent to each write loop and handed back when it exits.
    outbound: Option<mpsc::Receiver<EventWrapper>>,
    inbound: mpsc::Sender<EventWrapper>,
    state: watch::Sender<ConnectionState>,
    /// Start of the most recent dial; no two dials start closer than `retry_interval`.
    last_dial: Option<Instant>,
}

impl<D: Dialer> RetrySupervisor<D> {
    async fn run(mut self, initial: Option<WebSocketStream<D::Io>>) {
        let mut socket = match initial {
            Some(socket) => Some(socket),
            None => self.redial().await,
        };

        while let Some(current) = socket.take() {
            self.set_state(ConnectionState::Active);

            match self.pump(current).await {
                Generation::Closed => break,
                Generation::Failed => {
                    warn!(connection = %self.id, url = %self.url, "Connection to hub is dying. Trying to resurrect.");
                    self.set_state(ConnectionState::Retrying);
                    socket = self.redial().await;
                }
            }
        }

        info!(connection = %self.id, "Hub link closed by its owner");
        self.set_state(ConnectionState::Down);
    }

    /// Run one pump generation to completion.
    async fn pump(&mut self, socket: WebSocketStream<D::Io>) -> Generation {
        let Some(outbound) = self.outbound.take() else {
            return Generation::Closed;
        };

        let (sink, stream) = socket.split();
        let signals = PumpSignals::new();

        let reader = tokio::spawn(read_loop(
            stream,
            self.inbound.clone(),
            signals.clone(),
            ReadConfig {
                connection: self.id.clone(),
                keepalive: self.config.ping_wait,
                deadline: DeadlinePolicy::Fatal,
                format: WireFormat::Binary,
            },
        ));
        let writer = tokio::spawn(write_loop(
            sink,
            outbound,
            signals.clone(),
            WriteConfig {
                connection: self.id.clone(),
                write_wait: self.config.write_wait,
                format: WireFormat::Binary,
            },
        ));

        // The write loop's exit is the hand-off: from here on this task owns the failure.
        let generation = match writer.await {
            Ok(mut exit) => {
                signals.stop.cancel();
                close_sink(&mut exit.sink, &self.id, self.config.write_wait).await;
                debug!(connection = %self.id, outcome = ?exit.outcome, "[retry] Write pump closed");

                let queue_closed = matches!(exit.outcome, WriteOutcome::QueueClosed);
                self.outbound = Some(exit.outbound);
                if queue_closed {
                    Generation::Closed
                } else {
                    Generation::Failed
                }
            }
            Err(e) => {
                signals.stop.cancel();
                error!(connection = %self.id, error = %e, "Write pump aborted, outbound queue lost");
                Generation::Closed
            }
        };

        match reader.await {
            Ok(exit) => debug!(
                connection = %self.id,
                outcome = ?exit.outcome,
                since_last_ping = ?exit.last_ping.map(|at| at.elapsed()),
                "[retry] Read pump closed"
            ),
            Err(e) => error!(connection = %self.id, error = %e, "Read pump aborted"),
        }

        if self.inbound.is_closed() {
            return Generation::Closed;
        }
        generation
    }

    /// Dial until the hub answers.
    ///
    /// The first attempt is immediate only if the previous dial started at
    /// least `retry_interval` ago. Returns `None` only if the owner dropped
    /// the link meanwhile.
    async fn redial(&mut self) -> Option<WebSocketStream<D::Io>> {
        let mut attempt: u64 = 0;

        loop {
            if let Some(last) = self.last_dial {
                tokio::time::sleep_until(last + self.config.retry_interval).await;
            }

            if self.inbound.is_closed() {
                return None;
            }

            attempt += 1;
            self.last_dial = Some(Instant::now());
            info!(connection = %self.id, url = %self.url, attempt, "[retry] Retrying connection");

            match self.dialer.dial(&self.url).await {
                Ok(socket) => {
                    info!(connection = %self.id, attempt, "[retry] Retry success. Starting pumps");
                    metrics::record_reconnect();
                    return Some(socket);
                }
                Err(e) => {
                    metrics::record_connect_failure();
                    info!(
                        connection = %self.id,
                        error = %e,
                        "[retry] Retry failed, trying again in {:?}",
                        self.config.retry_interval
                    );
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(connection = %self.id, from = %previous, to = %state, "Hub link state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDialer;
    use futures_util::SinkExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::Message;

    fn event(i: u8) -> EventWrapper {
        EventWrapper::new("ITB-1101", vec![i])
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_connected() {
        let (dialer, mut peers) = MemoryDialer::new(2, 64 * 1024);
        let calls = dialer.calls.clone();
        let attempts = dialer.attempts.clone();

        let mut hub = HubConnection::new("cp1", "repeater", HubConfig::default());
        let err = hub.connect("hub.local:7100", dialer).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(hub.state(), ConnectionState::Retrying);

        let mut server = peers.recv().await.unwrap();
        let mut state = hub.watch_state();
        state.wait_for(|s| s.is_active()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let attempts = attempts.lock().unwrap().clone();
        for pair in attempts.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= RETRY_INTERVAL);
        }
        assert!(attempts
            .iter()
            .all(|(url, _)| url == "ws://hub.local:7100/connect/repeater"));

        hub.send_event(event(1)).await.unwrap();
        let message = server.next().await.unwrap().unwrap();
        assert_eq!(WireFormat::Binary.parse(&message).unwrap().unwrap(), event(1));

        server.send(WireFormat::Binary.prepare(&event(2)).unwrap()).await.unwrap();
        assert_eq!(hub.read_event().await.unwrap(), event(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_pump_failure() {
        let (dialer, mut peers) = MemoryDialer::new(0, 64 * 1024);
        let calls = dialer.calls.clone();
        let attempts = dialer.attempts.clone();

        let mut hub = HubConnection::new("cp1", "repeater", HubConfig::default());
        hub.connect("hub.local:7100", dialer).await.unwrap();
        assert!(hub.is_started());

        let first = peers.recv().await.unwrap();
        drop(first);

        let mut second = peers.recv().await.unwrap();
        let mut state = hub.watch_state();
        state.wait_for(|s| s.is_active()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let attempts = attempts.lock().unwrap().clone();
        assert!(attempts[1].1 - attempts[0].1 >= RETRY_INTERVAL);

        // Queues survive the reconnect.
        hub.send_event(event(3)).await.unwrap();
        let message = second.next().await.unwrap().unwrap();
        assert_eq!(WireFormat::Binary.parse(&message).unwrap().unwrap(), event(3));

        second.send(WireFormat::Binary.prepare(&event(4)).unwrap()).await.unwrap();
        assert_eq!(hub.read_event().await.unwrap(), event(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_hub_keeps_retry_spacing() {
        let (dialer, mut peers) = MemoryDialer::new(0, 64 * 1024);
        let calls = dialer.calls.clone();
        let attempts = dialer.attempts.clone();

        // Hub that accepts and hangs up straight away.
        tokio::spawn(async move {
            while let Some(server) = peers.recv().await {
                drop(server);
            }
        });

        let mut hub = HubConnection::new("cp1", "repeater", HubConfig::default());
        hub.connect("hub.local:7100", dialer).await.unwrap();

        while calls.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let attempts = attempts.lock().unwrap().clone();
        for pair in attempts.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= RETRY_INTERVAL);
        }
        assert_ne!(hub.state(), ConnectionState::Down);
    }

    #[test]
    fn test_degenerate_config_is_clamped() {
        let config = HubConfig {
            queue_capacity: 0,
            retry_interval: Duration::ZERO,
            ..HubConfig::default()
        }
        .sanitized();
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.retry_interval, MIN_RETRY_INTERVAL);

        let defaults = HubConfig::default().sanitized();
        assert_eq!(defaults.retry_interval, RETRY_INTERVAL);
        assert_eq!(defaults.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_queue_still_works() {
        let (dialer, mut peers) = MemoryDialer::new(0, 64 * 1024);
        let config = HubConfig {
            queue_capacity: 0,
            ..HubConfig::default()
        };

        let mut hub = HubConnection::new("cp1", "repeater", config);
        hub.connect("hub.local:7100", dialer).await.unwrap();
        let mut server = peers.recv().await.unwrap();

        hub.send_event(event(7)).await.unwrap();
        let message = server.next().await.unwrap().unwrap();
        assert_eq!(WireFormat::Binary.parse(&message).unwrap().unwrap(), event(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_rejected() {
        let (dialer, _peers) = MemoryDialer::new(0, 64 * 1024);
        let (again, _more) = MemoryDialer::new(0, 64 * 1024);

        let mut hub = HubConnection::new("cp1", "repeater", HubConfig::default());
        hub.connect("hub.local:7100", dialer).await.unwrap();
        assert!(matches!(
            hub.connect("hub.local:7100", again).await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_owner_closes_link() {
        let (dialer, mut peers) = MemoryDialer::new(0, 64 * 1024);

        let mut hub = HubConnection::new("cp1", "repeater", HubConfig::default());
        hub.connect("hub.local:7100", dialer).await.unwrap();
        let mut server = peers.recv().await.unwrap();
        let mut state = hub.watch_state();

        drop(hub);

        match server.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert!(frame.reason.is_empty()),
            other => panic!("Expected close frame, got {:?}", other),
        }
        state
            .wait_for(|s| *s == ConnectionState::Down)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        // A tiny pipe stalls the first write, so the queue fills up behind it.
        let (dialer, mut peers) = MemoryDialer::new(0, 256);
        let config = HubConfig {
            queue_capacity: 2,
            ..HubConfig::default()
        };

        let mut hub = HubConnection::new("cp1", "repeater", config);
        hub.connect("hub.local:7100", dialer).await.unwrap();
        let mut server = peers.recv().await.unwrap();

        let events: Vec<_> = (0..8u8)
            .map(|i| EventWrapper::new("ITB-1101", vec![i; 1024]))
            .collect();
        let sent = Arc::new(AtomicUsize::new(0));
        let producer = {
            let sender = hub.sender();
            let events = events.clone();
            let sent = sent.clone();
            tokio::spawn(async move {
                for event in events {
                    sender.send(event).await.unwrap();
                    sent.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sent.load(Ordering::SeqCst) < events.len());

        for expected in &events {
            let message = server.next().await.unwrap().unwrap();
            assert_eq!(&WireFormat::Binary.parse(&message).unwrap().unwrap(), expected);
        }
        producer.await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), events.len());
    }
}

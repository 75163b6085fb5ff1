//! Repeats hub events to the devices of their room.
//!
//! Peer links are opened on demand: the first hub event for a room registers
//! a send queue for every configured device in that room and dials it in the
//! background. Events routed while the dial is in flight wait in the queue. A
//! device that fails to dial is left alone for [`DIAL_BACKOFF`]. A link that
//! goes idle unregisters itself, and the next event for its room opens a
//! fresh one.

use dashmap::DashMap;
use relay_core::{ConnectionRegistry, EventSource, HubEventWrapper, RegistrationChange, Router};
use relay_protocol::EventWrapper;
use relay_transport::{Dialer, PeerConfig, PeerLink, SendQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, PeerEntry};
use crate::metrics;

/// Registration kind used for peer links.
pub const PEER_KIND: &str = "repeater";

/// How long a device that failed to dial is skipped.
pub const DIAL_BACKOFF: Duration = Duration::from_secs(3);

enum Slot {
    /// Queue registered, dial in flight.
    Connecting,
    Open(PeerLink),
    /// Last dial failed; no new dial before the deadline.
    Backoff(Instant),
}

/// Bridges hub events to peer links.
pub struct Repeater<D: Dialer> {
    node_id: String,
    peers: Vec<PeerEntry>,
    peer_config: PeerConfig,
    router: Arc<Router>,
    links: DashMap<String, Slot>,
    dialer: D,
    dial_backoff: Duration,
    /// Where peer links deliver device events (the hub's outbound queue).
    uplink: mpsc::Sender<EventWrapper>,
}

impl<D: Dialer> Repeater<D> {
    /// Create a repeater for the peers in `config`.
    #[must_use]
    pub fn new(config: &Config, router: Arc<Router>, dialer: D, uplink: mpsc::Sender<EventWrapper>) -> Self {
        Self {
            node_id: config.node_id.clone(),
            peers: config.peers.clone(),
            peer_config: config.peer.to_peer_config(),
            router,
            links: DashMap::new(),
            dialer,
            dial_backoff: DIAL_BACKOFF,
            uplink,
        }
    }

    /// Set how long a device that failed to dial is skipped.
    #[must_use]
    pub fn with_dial_backoff(mut self, backoff: Duration) -> Self {
        self.dial_backoff = backoff;
        self
    }

    /// Handle one event read from the hub.
    ///
    /// Never waits on a device. Returns the number of peer queues the event
    /// was placed on, including those of links still dialing.
    pub fn handle_hub_event(self: &Arc<Self>, event: EventWrapper) -> usize {
        if !event.is_routable() {
            warn!(connection = %self.node_id, "Hub event without a room, dropping");
            return 0;
        }

        self.ensure_links(&event.room);

        let recipients = self
            .router
            .route(&HubEventWrapper::new(event, EventSource::Hub, &self.node_id));
        metrics::record_hub_event(recipients);
        recipients
    }

    /// Make sure every device in `room` has a registered queue, starting a
    /// background dial for each one that doesn't.
    pub fn ensure_links(self: &Arc<Self>, room: &str) {
        self.prune();

        for peer in self.peers.iter().filter(|p| p.room == room) {
            let dial = match self.links.get(&peer.id).as_deref() {
                None => true,
                Some(Slot::Connecting) => false,
                Some(Slot::Open(link)) => link.is_closed() || !self.router.is_registered(&peer.id),
                Some(Slot::Backoff(until)) => Instant::now() >= *until,
            };
            if !dial {
                continue;
            }

            let queue = SendQueue::new(self.peer_config.queue_capacity);
            let change = RegistrationChange::register(peer.id.clone(), queue.sender(), PEER_KIND, [room]);
            if let Err(e) = self.router.apply(change) {
                warn!(connection = %peer.id, room = %room, error = %e, "Peer link registration rejected");
                continue;
            }

            debug!(connection = %peer.id, room = %room, address = %peer.address, "Opening peer link");
            self.links.insert(peer.id.clone(), Slot::Connecting);
            tokio::spawn(Arc::clone(self).open_link(peer.clone(), queue));
        }
    }

    async fn open_link(self: Arc<Self>, peer: PeerEntry, queue: SendQueue) {
        let registry: Arc<dyn ConnectionRegistry> = self.router.clone();
        let opened = PeerLink::connect_queued(
            peer.id.clone(),
            peer.room.clone(),
            &peer.address,
            &self.dialer,
            queue,
            self.uplink.clone(),
            registry,
            self.peer_config.clone(),
        )
        .await;

        match opened {
            Ok(link) => {
                info!(connection = %peer.id, room = %peer.room, "Peer link open");
                self.links.insert(peer.id, Slot::Open(link));
            }
            Err(e) => {
                warn!(
                    connection = %peer.id,
                    room = %peer.room,
                    error = %e,
                    backoff = ?self.dial_backoff,
                    "Peer link failed to open"
                );
                self.router.unregister_connection(&peer.id);
                self.links
                    .insert(peer.id, Slot::Backoff(Instant::now() + self.dial_backoff));
            }
        }
    }

    /// Drop links that have closed.
    pub fn prune(&self) {
        self.links.retain(|id, slot| {
            let keep = !matches!(slot, Slot::Open(link) if link.is_closed());
            if !keep {
                debug!(connection = %id, "Dropping closed peer link");
            }
            keep
        });
    }

    /// Number of peer links that are open.
    #[must_use]
    pub fn live_links(&self) -> usize {
        self.links
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Open(link) if !link.is_closed()))
            .count()
    }

    /// Number of peer links still dialing.
    #[must_use]
    pub fn pending_links(&self) -> usize {
        self.links
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Connecting))
            .count()
    }
}

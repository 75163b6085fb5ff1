//! Room router.
//!
//! The router applies registration changes and delivers events to every
//! listener registered for the event's room.

use crate::message::HubEventWrapper;
use crate::registration::{validate_room_name, ConnectionRegistry, RegistrationChange};
use dashmap::{DashMap, DashSet};
use relay_protocol::EventWrapper;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A new registration was submitted without a queue.
    #[error("Registration {0} has no channel")]
    MissingChannel(String),

    /// A new registration was submitted without rooms.
    #[error("Registration {0} lists no rooms")]
    NoRooms(String),

    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// Deregistration of an unknown id.
    #[error("Not registered: {0}")]
    NotRegistered(String),
}

/// A live registration.
struct RegistrationEntry {
    /// The router's only sender for the listener queue.
    channel: mpsc::Sender<EventWrapper>,
    kind: String,
    rooms: HashSet<String>,
}

/// The room router.
///
/// Each registration owns exactly one sender. Removing the registration drops
/// that sender, which closes the listener's queue exactly once.
pub struct Router {
    /// Registrations indexed by id.
    registrations: DashMap<String, RegistrationEntry>,
    /// Room index (room -> registration ids).
    rooms: DashMap<String, DashSet<String>>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        info!("Creating room router");
        Self {
            registrations: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Apply a registration change.
    ///
    /// # Errors
    ///
    /// Returns an error if a new registration lacks a channel or rooms, names
    /// an invalid room, or a deregistration names an unknown id.
    pub fn apply(&self, change: RegistrationChange) -> Result<(), RouterError> {
        if change.create {
            self.register(change)
        } else {
            self.deregister(change.id())
        }
    }

    fn register(&self, change: RegistrationChange) -> Result<(), RouterError> {
        let RegistrationChange {
            registration,
            kind,
            rooms,
            ..
        } = change;
        let id = registration.id;

        let channel = registration
            .channel
            .ok_or_else(|| RouterError::MissingChannel(id.clone()))?;
        if rooms.is_empty() {
            return Err(RouterError::NoRooms(id));
        }
        for room in &rooms {
            validate_room_name(room).map_err(RouterError::InvalidRoom)?;
        }

        for room in &rooms {
            self.rooms.entry(room.clone()).or_default().insert(id.clone());
        }

        let mut entry = self
            .registrations
            .entry(id.clone())
            .or_insert_with(|| RegistrationEntry {
                channel: channel.clone(),
                kind: kind.clone(),
                rooms: HashSet::new(),
            });
        if !entry.channel.same_channel(&channel) {
            debug!(registration = %id, "Replacing registration channel");
            entry.channel = channel;
        }
        entry.rooms.extend(rooms);

        debug!(
            registration = %id,
            kind = %entry.kind,
            rooms = entry.rooms.len(),
            "Registered"
        );

        Ok(())
    }

    fn deregister(&self, id: &str) -> Result<(), RouterError> {
        let (_, entry) = self
            .registrations
            .remove(id)
            .ok_or_else(|| RouterError::NotRegistered(id.to_string()))?;

        for room in &entry.rooms {
            if let Some(ids) = self.rooms.get(room.as_str()) {
                ids.remove(id);
                if ids.is_empty() {
                    drop(ids); // Release the lock
                    self.rooms.remove_if(room.as_str(), |_, ids| ids.is_empty());
                }
            }
        }

        debug!(registration = %id, kind = %entry.kind, "Deregistered, closing channel");
        // `entry.channel` drops here, closing the listener queue.
        Ok(())
    }

    /// Deliver an event to every listener registered for its room.
    ///
    /// Delivery never blocks: a full listener queue drops the event.
    /// Returns the number of listeners that received it.
    pub fn route(&self, event: &HubEventWrapper) -> usize {
        let room = event.room();
        let ids: Vec<String> = self
            .rooms
            .get(room)
            .map(|ids| ids.iter().map(|id| id.clone()).collect())
            .unwrap_or_default();

        if ids.is_empty() {
            trace!(room = %room, source = %event.source, "No listeners for room");
            return 0;
        }

        let mut delivered = 0;
        for id in ids {
            let Some(entry) = self.registrations.get(&id) else {
                continue;
            };
            match entry.channel.try_send(event.event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(registration = %id, room = %room, "Listener queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(registration = %id, room = %room, "Listener queue closed");
                }
            }
        }

        trace!(
            room = %room,
            source = %event.source,
            source_id = %event.source_id,
            recipients = delivered,
            "Routed event"
        );
        delivered
    }

    /// Check if an id is registered.
    #[must_use]
    pub fn is_registered(&self, id: &str) -> bool {
        self.registrations.contains_key(id)
    }

    /// Get the rooms an id is registered for.
    #[must_use]
    pub fn rooms_of(&self, id: &str) -> Vec<String> {
        self.registrations
            .get(id)
            .map(|e| e.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get the number of listeners registered for a room.
    #[must_use]
    pub fn listener_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|ids| ids.len()).unwrap_or(0)
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            room_count: self.rooms.len(),
            registration_count: self.registrations.len(),
            total_subscriptions: self.registrations.iter().map(|e| e.rooms.len()).sum(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry for Router {
    fn unregister_connection(&self, id: &str) {
        if let Err(e) = self.deregister(id) {
            debug!(connection = %id, error = %e, "Unregister of unknown connection");
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of rooms with at least one listener.
    pub room_count: usize,
    /// Number of registrations.
    pub registration_count: usize,
    /// Total number of room subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventSource;

    fn hub_event(room: &str, payload: &'static [u8]) -> HubEventWrapper {
        HubEventWrapper::new(EventWrapper::new(room, payload), EventSource::Hub, "hub-1")
    }

    #[test]
    fn test_register_and_route() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(8);

        router
            .apply(RegistrationChange::register("cp1", tx, "repeater", ["ITB-1101"]))
            .unwrap();
        assert!(router.is_registered("cp1"));
        assert_eq!(router.listener_count("ITB-1101"), 1);

        assert_eq!(router.route(&hub_event("ITB-1101", b"on")), 1);
        assert_eq!(router.route(&hub_event("ITB-1102", b"off")), 0);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.room, "ITB-1101");
        assert_eq!(&received.payload[..], b"on");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deregister_closes_channel_once() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(8);

        router
            .apply(RegistrationChange::register("cp1", tx, "repeater", ["a", "b"]))
            .unwrap();
        assert_eq!(router.route(&hub_event("a", b"1")), 1);

        router.apply(RegistrationChange::deregister("cp1")).unwrap();

        // Delivered before closure, then closed.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());

        // Never written to after closure.
        assert_eq!(router.route(&hub_event("a", b"2")), 0);
        assert_eq!(router.route(&hub_event("b", b"3")), 0);

        // A second removal is reported, not repeated.
        assert!(matches!(
            router.apply(RegistrationChange::deregister("cp1")),
            Err(RouterError::NotRegistered(_))
        ));
        assert_eq!(router.stats().room_count, 0);
    }

    #[test]
    fn test_register_validation() {
        let router = Router::new();
        let (tx, _rx) = mpsc::channel(1);

        let mut missing = RegistrationChange::register("cp1", tx.clone(), "repeater", ["a"]);
        missing.registration.channel = None;
        assert!(matches!(
            router.apply(missing),
            Err(RouterError::MissingChannel(_))
        ));

        let no_rooms = RegistrationChange::register("cp1", tx.clone(), "repeater", Vec::<String>::new());
        assert!(matches!(router.apply(no_rooms), Err(RouterError::NoRooms(_))));

        let bad_room = RegistrationChange::register("cp1", tx, "repeater", [""]);
        assert!(matches!(
            router.apply(bad_room),
            Err(RouterError::InvalidRoom(_))
        ));

        assert!(!router.is_registered("cp1"));
    }

    #[test]
    fn test_full_listener_drops_event() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(1);

        router
            .apply(RegistrationChange::register("cp1", tx, "repeater", ["a"]))
            .unwrap();

        assert_eq!(router.route(&hub_event("a", b"1")), 1);
        assert_eq!(router.route(&hub_event("a", b"2")), 0);
        assert_eq!(&rx.try_recv().unwrap().payload[..], b"1");
    }

    #[test]
    fn test_registry_unregister_connection() {
        let router = Router::new();
        let (tx, _rx) = mpsc::channel(1);

        router
            .apply(RegistrationChange::register("cp1", tx, "repeater", ["a"]))
            .unwrap();

        router.unregister_connection("cp1");
        assert!(!router.is_registered("cp1"));
        assert_eq!(router.listener_count("a"), 0);

        // Unknown ids are tolerated.
        router.unregister_connection("cp1");
    }

    #[test]
    fn test_router_stats() {
        let router = Router::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        router
            .apply(RegistrationChange::register("cp1", tx1, "repeater", ["a", "b"]))
            .unwrap();
        router
            .apply(RegistrationChange::register("cp2", tx2, "messenger", ["a"]))
            .unwrap();

        let stats = router.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.registration_count, 2);
        assert_eq!(stats.total_subscriptions, 3);

        let mut rooms = router.rooms_of("cp1");
        rooms.sort();
        assert_eq!(rooms, vec!["a".to_string(), "b".to_string()]);
    }
}

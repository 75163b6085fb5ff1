//! Listener registration.
//!
//! A listener subscribes a queue to a set of rooms by submitting a
//! [`RegistrationChange`] with `create = true`. Submitting one with
//! `create = false` removes it; the registry then drops its sender so the
//! listener sees its queue close and knows it is safe to exit.

use relay_protocol::EventWrapper;
use std::collections::HashSet;
use tokio::sync::mpsc;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if !name.chars().all(|c| !c.is_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// One listener's subscription handle.
///
/// Both fields are required to create a registration; only `id` is needed
/// to remove one.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Identifies the listener during deregistration.
    pub id: String,
    /// Queue the listener reads events from.
    pub channel: Option<mpsc::Sender<EventWrapper>>,
}

/// A request to add or remove a registration.
#[derive(Debug, Clone)]
pub struct RegistrationChange {
    pub registration: Registration,
    /// Kind of listener (e.g. `repeater`, `messenger`).
    pub kind: String,
    pub rooms: HashSet<String>,
    /// `true` adds the registration for every room, `false` removes it.
    pub create: bool,
}

impl RegistrationChange {
    /// Build a request registering `channel` for `rooms`.
    #[must_use]
    pub fn register<I, R>(
        id: impl Into<String>,
        channel: mpsc::Sender<EventWrapper>,
        kind: impl Into<String>,
        rooms: I,
    ) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            registration: Registration {
                id: id.into(),
                channel: Some(channel),
            },
            kind: kind.into(),
            rooms: rooms.into_iter().map(Into::into).collect(),
            create: true,
        }
    }

    /// Build a request removing the registration with `id`.
    #[must_use]
    pub fn deregister(id: impl Into<String>) -> Self {
        Self {
            registration: Registration {
                id: id.into(),
                channel: None,
            },
            kind: String::new(),
            rooms: HashSet::new(),
            create: false,
        }
    }

    /// Get the registration id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.registration.id
    }
}

/// Owner of registrations that a connection removes itself from when it dies.
pub trait ConnectionRegistry: Send + Sync {
    /// Stop routing to the connection `id` and reclaim its resources.
    fn unregister_connection(&self, id: &str);
}

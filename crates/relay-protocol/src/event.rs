//! Event wrapper carried over every relay connection.
//!
//! The wrapper pairs a routing key (the room) with an opaque payload.
//! Nothing in the transport ever looks inside the payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An event tagged with the room it is routed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventWrapper {
    /// Routing key.
    pub room: String,
    /// Encoded event, never interpreted by the relay.
    pub payload: Bytes,
}

impl EventWrapper {
    /// Create a new event wrapper.
    #[must_use]
    pub fn new(room: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            room: room.into(),
            payload: payload.into(),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the event carries a room and can be routed.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        !self.room.is_empty()
    }
}

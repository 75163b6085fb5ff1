//! Hub-side event types.
//!
//! These types remember where an event came from. Routing itself only ever
//! looks at the room.

use relay_protocol::EventWrapper;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of component an event entered the hub from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Messenger,
    Broadcaster,
    Receiver,
    Hub,
}

impl EventSource {
    /// Get the wire name of the source.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Messenger => "messenger",
            EventSource::Broadcaster => "broadcaster",
            EventSource::Receiver => "receiver",
            EventSource::Hub => "hub",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEventWrapper {
    /// The routed event.
    pub event: EventWrapper,
    /// Kind of component the event came from.
    pub source: EventSource,
    /// Identifier of the specific component.
    pub source_id: String,
}

impl HubEventWrapper {
    /// Tag an event with its origin.
    #[must_use]
    pub fn new(event: EventWrapper, source: EventSource, source_id: impl Into<String>) -> Self {
        Self {
            event,
            source,
            source_id: source_id.into(),
        }
    }

    /// Get the room the event is routed by.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.event.room
    }

    /// Strip the provenance.
    #[must_use]
    pub fn into_event(self) -> EventWrapper {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_names() {
        assert_eq!(EventSource::Messenger.to_string(), "messenger");
        assert_eq!(EventSource::Receiver.as_str(), "receiver");
        assert_eq!(EventSource::Hub.as_str(), "hub");
    }

    #[test]
    fn test_hub_event_wrapper() {
        let event = EventWrapper::new("ITB-1101", b"data".to_vec());
        let wrapped = HubEventWrapper::new(event.clone(), EventSource::Broadcaster, "bc-1");

        assert_eq!(wrapped.room(), "ITB-1101");
        assert_eq!(wrapped.source, EventSource::Broadcaster);
        assert_eq!(wrapped.source_id, "bc-1");
        assert_eq!(wrapped.into_event(), event);
    }
}

//! JSON framing for peer links.
//!
//! Peer links exchange events as WebSocket text messages, one JSON object each.

use crate::codec::ProtocolError;
use crate::event::EventWrapper;

/// Encode an event as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn prepare_json(event: &EventWrapper) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an event from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the text is not an event object or names no room.
pub fn parse_json(text: &str) -> Result<EventWrapper, ProtocolError> {
    let event: EventWrapper = serde_json::from_str(text)?;
    if !event.is_routable() {
        return Err(ProtocolError::EmptyRoom);
    }
    Ok(event)
}

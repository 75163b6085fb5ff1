//! Binary framing for hub connections.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.
//! One WebSocket binary message carries exactly one frame.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::event::EventWrapper;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur while framing or unframing events.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data for the declared frame length.
    #[error("Malformed frame: need {0} more bytes")]
    Incomplete(usize),

    /// Bytes left over after the declared frame length.
    #[error("Malformed frame: {0} trailing bytes")]
    Trailing(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Malformed frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON decoding error.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame decoded but carries no room.
    #[error("Malformed frame: empty room")]
    EmptyRoom,
}

impl ProtocolError {
    /// Whether this error means the inbound bytes could not be turned into an event.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        !matches!(self, ProtocolError::Encode(_))
    }
}

/// Frame an event for the wire.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack map `{room, payload}`
///
/// # Errors
///
/// Returns an error if the encoded frame exceeds [`MAX_FRAME_SIZE`].
pub fn prepare(event: &EventWrapper) -> Result<Bytes, ProtocolError> {
    let body = rmp_serde::to_vec_named(event)?;

    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);

    Ok(buf.freeze())
}

/// Parse one framed event.
///
/// The whole slice must be exactly one frame.
///
/// # Errors
///
/// Returns an error if the data is short, oversized, carries trailing bytes,
/// does not decode, or names no room.
pub fn parse(data: &[u8]) -> Result<EventWrapper, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }
    if data.len() > total_size {
        return Err(ProtocolError::Trailing(data.len() - total_size));
    }

    let event: EventWrapper = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..])?;
    if !event.is_routable() {
        return Err(ProtocolError::EmptyRoom);
    }

    Ok(event)
}

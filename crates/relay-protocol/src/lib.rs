//! # relay-protocol
//!
//! Wire framing for relay event transport.
//!
//! Every connection carries [`EventWrapper`]s: a room (the routing key) and an
//! opaque payload. Hub connections frame them as length-prefixed MessagePack in
//! binary messages; peer links use JSON text messages.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, EventWrapper};
//!
//! let event = EventWrapper::new("ITB-1101", b"{\"key\":\"power\"}".to_vec());
//!
//! let framed = codec::prepare(&event).unwrap();
//! let parsed = codec::parse(&framed).unwrap();
//! assert_eq!(parsed, event);
//! ```

pub mod codec;
pub mod event;
pub mod json;

pub use codec::{parse, prepare, ProtocolError};
pub use event::EventWrapper;
pub use json::{parse_json, prepare_json};

//! # relay-transport
//!
//! WebSocket links for relay.
//!
//! Every link runs a *pump*: a read loop and a write loop over the two halves
//! of one socket, bridged to in-process queues. A supervisor owns the pump
//! and decides what happens when it dies:
//!
//! - **Hub link** ([`HubConnection`]) - long-lived, reconnects forever on a
//!   fixed interval and keeps its queues across reconnects
//! - **Peer link** ([`PeerLink`]) - short-lived, closes itself after a TTL of
//!   inactivity and unregisters from its owner
//!
//! ```rust,ignore
//! use relay_transport::{HubConfig, HubConnection, WsDialer};
//!
//! let mut hub = HubConnection::new("node-1", "repeater", HubConfig::default());
//! hub.connect("hub.local:8080", WsDialer::new()).await?;
//! while let Some(event) = hub.read_event().await {
//!     // Handle event
//! }
//! ```

pub mod hub;
pub mod metrics;
pub mod peer;
pub mod pump;
pub mod signal;
pub mod state;
pub mod traits;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use hub::{HubConfig, HubConnection};
pub use peer::{LinkExit, PeerConfig, PeerLink, SendQueue};
pub use pump::{DeadlinePolicy, WireFormat};
pub use signal::PumpSignals;
pub use state::ConnectionState;
pub use traits::{Dialer, TransportError};
pub use websocket::{hub_url, peer_url, WsDialer};

//! # relay-core
//!
//! Registration model and room routing for relay.
//!
//! - **Message** - Hub-side provenance for events (`HubEventWrapper`)
//! - **Registration** - Listener registration requests and the registry trait
//!   connections unregister themselves from
//! - **Router** - Delivers events to listener queues by room
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  RegistrationChange  ┌─────────────┐
//! │   Listener   │─────────────────────▶│   Router    │
//! └──────────────┘                      └─────────────┘
//!        ▲                                     │
//!        │         EventWrapper (by room)      │
//!        └─────────────────────────────────────┘
//! ```

pub mod message;
pub mod registration;
pub mod router;

pub use message::{EventSource, HubEventWrapper};
pub use registration::{ConnectionRegistry, Registration, RegistrationChange};
pub use router::{Router, RouterError, RouterStats};

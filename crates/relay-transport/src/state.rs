//! Connection lifecycle state.

use std::fmt;

/// Lifecycle state of a supervised connection.
///
/// Only the supervisor writes it; everything else reads it through a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Dialing for the first time.
    Connecting,
    /// Both loops are running.
    Active,
    /// The pump failed and the supervisor is reconnecting.
    Retrying,
    /// Terminal: the connection is gone.
    Down,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Retrying => "retrying",
            ConnectionState::Down => "down",
        }
    }

    /// Whether events currently flow.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

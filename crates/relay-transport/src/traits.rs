//! Transport errors and the dialing seam.
//!
//! Supervisors never open sockets themselves; they ask a [`Dialer`]. The
//! production dialer speaks WebSocket over TCP, tests hand out in-memory
//! sockets.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing or the WebSocket handshake failed.
    #[error("Failed to connect to {url}: {reason}")]
    ConnectionFailed {
        /// Address that was dialed.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// The handshake did not finish in time.
    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(String),

    /// Writing to the socket failed.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// A write did not finish inside the write deadline.
    #[error("Write timed out")]
    WriteTimeout,

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection has already been started.
    #[error("Connection already started")]
    AlreadyStarted,
}

impl TransportError {
    /// Whether this is a failure to establish a connection.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed { .. } | TransportError::HandshakeTimeout(_)
        )
    }
}

/// Opens WebSocket connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Byte stream underneath the WebSocket.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Dial `url` and complete the WebSocket handshake.
    async fn dial(&self, url: &str) -> Result<WebSocketStream<Self::Io>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        let failed = TransportError::ConnectionFailed {
            url: "ws://hub/connect/repeater".into(),
            reason: "refused".into(),
        };
        assert!(failed.is_connection_error());
        assert!(TransportError::HandshakeTimeout("ws://hub".into()).is_connection_error());
        assert!(!TransportError::WriteTimeout.is_connection_error());
        assert!(failed.to_string().contains("refused"));
    }
}

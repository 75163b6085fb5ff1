//! WebSocket dialing.
//!
//! This module provides the production [`Dialer`] using tokio-tungstenite,
//! plus the endpoint layout shared with the hub and device listeners.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::traits::{Dialer, TransportError};

/// Bound on the TCP connect plus WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Port the repeater endpoint listens on, on every device.
pub const REPEATER_PORT: u16 = 6998;

/// URL of the hub endpoint for a connection type.
#[must_use]
pub fn hub_url(hub_addr: &str, connection_type: &str) -> String {
    format!("ws://{}/connect/{}", hub_addr, connection_type)
}

/// URL of the repeater endpoint on a device.
#[must_use]
pub fn peer_url(device_addr: &str, port: u16) -> String {
    format!("ws://{}:{}/repeaterconn", device_addr, port)
}

/// Dials WebSocket connections over TCP.
#[derive(Debug, Clone)]
pub struct WsDialer {
    handshake_timeout: Duration,
}

impl WsDialer {
    /// Create a dialer with the default handshake timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(HANDSHAKE_TIMEOUT)
    }

    /// Create a dialer with a custom handshake timeout.
    #[must_use]
    pub fn with_timeout(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for WsDialer {
    type Io = MaybeTlsStream<TcpStream>;

    async fn dial(&self, url: &str) -> Result<WebSocketStream<Self::Io>, TransportError> {
        debug!(url = %url, "Dialing");

        match tokio::time::timeout(self.handshake_timeout, connect_async(url)).await {
            Ok(Ok((stream, _response))) => {
                debug!(url = %url, "WebSocket handshake completed");
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "Failed opening websocket");
                Err(TransportError::ConnectionFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(url = %url, "WebSocket handshake timed out");
                Err(TransportError::HandshakeTimeout(url.to_string()))
            }
        }
    }
}

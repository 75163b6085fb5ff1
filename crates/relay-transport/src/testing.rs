//! In-memory doubles for pump and supervisor tests.

use async_trait::async_trait;
use relay_core::ConnectionRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::traits::{Dialer, TransportError};

pub(crate) type MemorySocket = WebSocketStream<DuplexStream>;

/// A connected client/server WebSocket pair over an in-memory pipe.
pub(crate) async fn ws_pair(buffer: usize) -> (MemorySocket, MemorySocket) {
    let (a, b) = tokio::io::duplex(buffer);
    let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
    (client, server)
}

/// Dialer that fails a fixed number of times, then hands out in-memory sockets.
///
/// The server end of every successful dial is sent to `peers`.
pub(crate) struct MemoryDialer {
    failures_left: AtomicUsize,
    buffer: usize,
    pub calls: Arc<AtomicUsize>,
    pub attempts: Arc<Mutex<Vec<(String, Instant)>>>,
    peers: mpsc::UnboundedSender<MemorySocket>,
}

impl MemoryDialer {
    pub fn new(failures: usize, buffer: usize) -> (Self, mpsc::UnboundedReceiver<MemorySocket>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            failures_left: AtomicUsize::new(failures),
            buffer,
            calls: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
            peers,
        };
        (dialer, rx)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Io = DuplexStream;

    async fn dial(&self, url: &str) -> Result<WebSocketStream<Self::Io>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::ConnectionFailed {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }

        let (client, server) = ws_pair(self.buffer).await;
        let _ = self.peers.send(server);
        Ok(client)
    }
}

/// Registry that records which connections unregistered.
#[derive(Default)]
pub(crate) struct RecordingRegistry {
    pub unregistered: Mutex<Vec<String>>,
}

impl ConnectionRegistry for RecordingRegistry {
    fn unregister_connection(&self, id: &str) {
        self.unregistered.lock().unwrap().push(id.to_string());
    }
}

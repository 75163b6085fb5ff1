//! Completion signals shared between a pump's loops and its supervisor.
//!
//! Each signal is a [`CancellationToken`]: once cancelled it stays cancelled,
//! and any number of tasks may wait on it or check it without consuming it.

use tokio_util::sync::CancellationToken;

/// The signals of one pump generation.
#[derive(Debug, Clone, Default)]
pub struct PumpSignals {
    /// Cancelled by the read loop when it exits.
    pub read_done: CancellationToken,
    /// Cancelled by the write loop when it exits.
    pub write_done: CancellationToken,
    /// Cancelled by the supervisor to ask both loops to stop.
    pub stop: CancellationToken,
}

impl PumpSignals {
    /// Create a fresh, uncancelled set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until either loop has exited.
    pub async fn either_done(&self) {
        tokio::select! {
            _ = self.read_done.cancelled() => {}
            _ = self.write_done.cancelled() => {}
        }
    }

    /// Whether either loop has exited.
    #[must_use]
    pub fn is_either_done(&self) -> bool {
        self.read_done.is_cancelled() || self.write_done.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_waiter_observes_stop() {
        let signals = PumpSignals::new();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let s = signals.clone();
                tokio::spawn(async move { s.stop.cancelled().await })
            })
            .collect();

        tokio::task::yield_now().await;
        signals.stop.cancel();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }

        // Late waiters return straight away.
        tokio::time::timeout(Duration::from_millis(10), signals.stop.cancelled())
            .await
            .unwrap();
        assert!(!signals.is_either_done());
    }

    #[tokio::test]
    async fn test_either_done() {
        let signals = PumpSignals::new();
        signals.write_done.cancel();
        tokio::time::timeout(Duration::from_millis(10), signals.either_done())
            .await
            .unwrap();
        assert!(signals.is_either_done());
        assert!(!signals.read_done.is_cancelled());
    }
}

//! Health endpoint.

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use relay_core::Router as EventRouter;
use relay_transport::ConnectionState;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// What `/health` reads from.
#[derive(Clone)]
pub struct HealthState {
    /// Hub link state.
    pub hub: watch::Receiver<ConnectionState>,
    /// Event router; live peer links are its registrations.
    pub router: Arc<EventRouter>,
}

/// Body of a `/health` response.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub hub: &'static str,
    pub peer_links: usize,
    pub rooms: usize,
}

impl HealthState {
    /// Take a snapshot.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let hub = *self.hub.borrow();
        let stats = self.router.stats();

        HealthReport {
            status: if hub.is_active() { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            hub: hub.as_str(),
            peer_links: stats.registration_count,
            rooms: stats.room_count,
        }
    }
}

/// Serve `/health` on `addr` until the process exits.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(addr: SocketAddr, state: HealthState) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint listening on http://{}/health", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let report = state.report();
    let code = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::RegistrationChange;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_health_reports_hub_and_links() {
        let (hub_tx, hub_rx) = watch::channel(ConnectionState::Retrying);
        let router = Arc::new(EventRouter::new());
        let state = HealthState {
            hub: hub_rx,
            router: router.clone(),
        };

        let report = state.report();
        assert_eq!(report.status, "degraded");
        assert_eq!(report.hub, "retrying");
        assert_eq!(report.peer_links, 0);

        let (tx, _rx) = mpsc::channel(1);
        router
            .apply(RegistrationChange::register("cp1", tx, "repeater", ["ITB-1101"]))
            .unwrap();
        hub_tx.send(ConnectionState::Active).unwrap();

        let report = state.report();
        assert_eq!(report.status, "ok");
        assert_eq!(report.peer_links, 1);
        assert_eq!(report.rooms, 1);

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_unavailable_while_down() {
        let (_hub_tx, hub_rx) = watch::channel(ConnectionState::Down);
        let state = HealthState {
            hub: hub_rx,
            router: Arc::new(EventRouter::new()),
        };

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! # Relay Node
//!
//! Repeater node: holds a self-healing link to the hub and repeats each hub
//! event to the devices of its room over short-lived peer links.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Config file is picked up from ./relay.toml, /etc/relay/relay.toml
//! # or ~/.config/relay/relay.toml
//!
//! # Run with environment overrides
//! RELAY__HUB_ADDRESS=hub.local:7100 RELAY__PEER__TTL_MS=10000 relay
//! ```

mod config;
mod health;
mod metrics;
mod repeater;

use anyhow::Result;
use relay_core::Router;
use relay_transport::{HubConnection, WsDialer};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::health::HealthState;
use crate::repeater::Repeater;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    config.validate()?;

    info!(
        "Starting relay node {} ({} peers) for hub {}",
        config.node_id,
        config.peers.len(),
        config.hub_address
    );

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let router = Arc::new(Router::new());
    let mut hub = HubConnection::new(
        config.node_id.clone(),
        config.connection_type.clone(),
        config.hub.to_hub_config(),
    );
    if let Err(e) = hub.connect(&config.hub_address, WsDialer::new()).await {
        warn!("Hub unreachable ({}), retrying in the background", e);
    }

    if config.health.enabled {
        let state = HealthState {
            hub: hub.watch_state(),
            router: router.clone(),
        };
        let addr = config.health_addr()?;
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, state).await {
                error!("Health endpoint failed: {:#}", e);
            }
        });
    }

    let repeater = Arc::new(Repeater::new(&config, router, WsDialer::new(), hub.sender()));
    let mut hub_state = hub.watch_state();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = hub.read_event() => match event {
                Some(event) => {
                    repeater.handle_hub_event(event);
                }
                None => {
                    warn!("Hub link is down for good");
                    break;
                }
            },
            Ok(()) = hub_state.changed() => {
                let state = *hub_state.borrow_and_update();
                metrics::set_hub_state(state);
                info!("Hub link {}", state);
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

//! Node configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (first of `relay.toml`, `/etc/relay/relay.toml`,
//!   `~/.config/relay/relay.toml`)
//! - Environment variables (`RELAY__*`, e.g. `RELAY__HUB__RETRY_INTERVAL_MS`)

use ::config::Environment;
use anyhow::{bail, Context, Result};
use relay_core::registration::validate_room_name;
use relay_transport::{HubConfig, PeerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const ENV_PREFIX: &str = "RELAY";

const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity this node presents to the hub.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Connection type announced in the hub URL.
    #[serde(default = "default_connection_type")]
    pub connection_type: String,

    /// Hub `host:port`.
    #[serde(default = "default_hub_address")]
    pub hub_address: String,

    /// Hub link settings.
    #[serde(default)]
    pub hub: HubSection,

    /// Peer link settings.
    #[serde(default)]
    pub peer: PeerSection,

    /// Devices this node repeats to.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Health endpoint configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Hub link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Capacity of each event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Wait between reconnect attempts in milliseconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Read deadline window in milliseconds.
    #[serde(default = "default_ping_wait")]
    pub ping_wait_ms: u64,

    /// Write deadline window in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

/// Peer link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    /// Inactivity window in milliseconds.
    #[serde(default = "default_ttl")]
    pub ttl_ms: u64,

    /// Port of the device repeater endpoint.
    #[serde(default = "default_peer_port")]
    pub port: u16,

    /// Capacity of each event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Write deadline window in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

/// A device this node repeats to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Connection id, unique per node.
    pub id: String,
    /// Device address (host, no port).
    pub address: String,
    /// Room whose events the device receives.
    pub room: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Health endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Serve `/health`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host to bind to.
    #[serde(default = "default_health_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_health_port")]
    pub port: u16,
}

/// `RELAY__SECTION__KEY` overrides, e.g. `RELAY__PEER__TTL_MS=10000`.
fn env_overrides() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

// Default value functions
fn default_node_id() -> String {
    "relay-1".to_string()
}

fn default_connection_type() -> String {
    "repeater".to_string()
}

fn default_hub_address() -> String {
    "127.0.0.1:7100".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retry_interval() -> u64 {
    3_000
}

fn default_ping_wait() -> u64 {
    60_000
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_ttl() -> u64 {
    5_000
}

fn default_peer_port() -> u16 {
    6998
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_health_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            connection_type: default_connection_type(),
            hub_address: default_hub_address(),
            hub: HubSection::default(),
            peer: PeerSection::default(),
            peers: Vec::new(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            retry_interval_ms: default_retry_interval(),
            ping_wait_ms: default_ping_wait(),
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl(),
            port: default_peer_port(),
            queue_capacity: default_queue_capacity(),
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_health_host(),
            port: default_health_port(),
        }
    }
}

impl HubSection {
    /// Convert to transport settings.
    #[must_use]
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            ping_wait: Duration::from_millis(self.ping_wait_ms),
            write_wait: Duration::from_millis(self.write_wait_ms),
        }
    }
}

impl PeerSection {
    /// Convert to transport settings.
    #[must_use]
    pub fn to_peer_config(&self) -> PeerConfig {
        PeerConfig {
            ttl: Duration::from_millis(self.ttl_ms),
            port: self.port,
            queue_capacity: self.queue_capacity,
            write_wait: Duration::from_millis(self.write_wait_ms),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned()))
            .find(|path| path.exists());

        Self::assemble(file.as_deref(), env_overrides())
    }

    /// Layer `env` over the file at `path` (or over the defaults).
    fn assemble(path: Option<&Path>, env: Environment) -> Result<Self> {
        let base = match path {
            Some(path) => {
                info!("Loading config from {}", path.display());
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        let config: Config = ::config::Config::builder()
            .add_source(
                ::config::Config::try_from(&base).context("Failed to stage base configuration")?,
            )
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.hub_address.is_empty() {
            bail!("hub_address must be set");
        }
        if self.hub.queue_capacity == 0 || self.peer.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }
        if self.peer.ttl_ms == 0 {
            bail!("peer.ttl_ms must be positive");
        }

        let mut ids = HashSet::new();
        for peer in &self.peers {
            if !ids.insert(peer.id.as_str()) {
                bail!("duplicate peer id: {}", peer.id);
            }
            validate_room_name(&peer.room)
                .map_err(|e| anyhow::anyhow!("peer {}: {}", peer.id, e))?;
        }

        Ok(())
    }

    /// Get the health endpoint address.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn health_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.health.host, self.health.port)
            .parse()
            .with_context(|| format!("Invalid health address {}:{}", self.health.host, self.health.port))
    }
}

//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_HOST, COURIER_PORT)
//! - TOML configuration file

use anyhow::{Context, Result};
use courier_core::{DeliveryMode, NodeConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Delivery guarantees for identities on other nodes.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Shared broker.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Login credentials.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Connection-level authorization.
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Delivery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// `queued` (default) or `fire_and_forget`.
    #[serde(default)]
    pub mode: DeliveryMode,
}

/// Broker implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// In-process broker. Only useful for a single node.
    #[default]
    Memory,
    /// Redis server.
    Redis,
}

/// How broker connections are shared between roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerTopology {
    /// One connection for lists, publishing and subscribing.
    #[default]
    Single,
    /// A dedicated connection per role.
    Split,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker implementation.
    #[serde(default)]
    pub backend: BrokerBackend,

    /// Connection sharing.
    #[serde(default)]
    pub topology: BrokerTopology,

    /// Broker URL, used for list commands and as the fallback for the others.
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Publisher URL in split topology.
    #[serde(default)]
    pub publish_url: Option<String>,

    /// Subscriber URL in split topology.
    #[serde(default)]
    pub subscribe_url: Option<String>,

    /// Broker password.
    #[serde(default)]
    pub credential: Option<String>,

    /// Prefix for queue keys and channel names.
    #[serde(default)]
    pub key_prefix: String,
}

/// Login credentials. An empty table accepts every login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Identity -> credential.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

/// Handshake configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Shared token required to open a connection.
    #[serde(default)]
    pub token: Option<String>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Dead letters kept in memory.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
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

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_dead_letter_capacity() -> usize {
    courier_core::dead_letter::DEFAULT_DEAD_LETTER_CAPACITY
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            delivery: DeliveryConfig::default(),
            broker: BrokerConfig::default(),
            auth: AuthConfig::default(),
            handshake: HandshakeConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            topology: BrokerTopology::default(),
            url: default_broker_url(),
            publish_url: None,
            subscribe_url: None,
            credential: None,
            key_prefix: String::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            dead_letter_capacity: default_dead_letter_capacity(),
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

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
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

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Core node settings derived from this configuration.
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            mode: self.delivery.mode,
            key_prefix: self.broker.key_prefix.clone(),
            broker_credential: self.broker.credential.clone(),
            dead_letter_capacity: self.limits.dead_letter_capacity,
            ..NodeConfig::default()
        }
    }
}

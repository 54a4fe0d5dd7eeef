//! Configuration system for meshnet.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHNET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshnet/config.toml
//!   3. ~/.config/meshnet/config.toml

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::DEFAULT_MAX_FORWARDING_HOPS;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeSettings,
    pub tcp_listeners: Vec<TcpListenerConfig>,
    pub tcp_peers: Vec<TcpPeerConfig>,
}

/// Per-node engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Node identity. Empty = derive from the hostname.
    pub id: String,
    /// Forwarding budget stamped on locally originated packets.
    pub max_forwarding_hops: u8,
    /// Interval between unconditional adjacency broadcasts.
    pub route_update_interval_ms: u64,
    /// Adjacency records not refreshed within this window are discarded.
    pub node_expiry_ms: u64,
    /// How long a new link may take to complete the Hello exchange.
    pub handshake_timeout_ms: u64,
    /// Inbound datagram queue per listener.
    pub listener_queue_depth: usize,
    /// Outbound frame queue per connection.
    pub connection_queue_depth: usize,
    /// Run the built-in "ping" echo service.
    pub ping_service: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpListenerConfig {
    /// Socket address to accept peers on, e.g. "0.0.0.0:7323".
    pub bind: String,
    /// Routing cost of links accepted here.
    pub cost: f64,
    /// Per-peer cost overrides, keyed by node name.
    pub node_cost: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpPeerConfig {
    /// Remote "host:port" to dial.
    pub address: String,
    /// Routing cost of this link.
    pub cost: f64,
    /// Delay before redialing after the link drops.
    pub redial_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            max_forwarding_hops: DEFAULT_MAX_FORWARDING_HOPS,
            route_update_interval_ms: 10_000,
            node_expiry_ms: 60_000,
            handshake_timeout_ms: 5_000,
            listener_queue_depth: 128,
            connection_queue_depth: 256,
            ping_service: true,
        }
    }
}

impl Default for TcpListenerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7323".to_string(),
            cost: 1.0,
            node_cost: HashMap::new(),
        }
    }
}

impl Default for TcpPeerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            cost: 1.0,
            redial_ms: 5_000,
        }
    }
}

impl NodeSettings {
    pub fn route_update_interval(&self) -> Duration {
        Duration::from_millis(self.route_update_interval_ms)
    }

    pub fn node_expiry(&self) -> Duration {
        Duration::from_millis(self.node_expiry_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl TcpPeerConfig {
    pub fn redial_interval(&self) -> Duration {
        Duration::from_millis(self.redial_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("meshnet")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&path, &text)?
        } else {
            MeshConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config document. `path` is only used in error messages.
    pub fn from_toml(path: &std::path::Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHNET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESHNET_* overrides. `lookup` resolves a variable name.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MESHNET_NODE__ID") {
            self.node.id = v;
        }
        if let Some(v) = lookup("MESHNET_NODE__MAX_FORWARDING_HOPS") {
            if let Ok(hops) = v.parse() {
                self.node.max_forwarding_hops = hops;
            }
        }
        if let Some(v) = lookup("MESHNET_NODE__ROUTE_UPDATE_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.node.route_update_interval_ms = ms;
            }
        }
        if let Some(v) = lookup("MESHNET_NODE__PING_SERVICE") {
            self.node.ping_service = v == "true" || v == "1";
        }
    }
}

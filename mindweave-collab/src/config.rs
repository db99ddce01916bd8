//! Server configuration, loaded from TOML.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//!
//! [room]
//! conflict_threshold_ms = 1000
//! conflict_policy = "latest_per_node"
//!
//! [[auth.tokens]]
//! token = "secret"
//! participant_id = "alice"
//! display_name = "Alice"
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conflict::ConflictPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub room: RoomConfig,
    pub persistence: PersistenceConfig,
    pub auth: AuthConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Listener and per-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Buffered frames on a session's operations lane before it is evicted.
    pub operations_capacity: usize,
    /// Buffered frames on a session's presence lane before frames are dropped.
    pub presence_capacity: usize,
    /// Queued commands per room.
    pub command_capacity: usize,
    /// Time allowed for a client to send its upgrade request.
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            operations_capacity: 256,
            presence_capacity: 64,
            command_capacity: 1024,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Recent-operation window length.
    pub window_size: usize,
    pub conflict_threshold_ms: u64,
    pub conflict_policy: ConflictPolicy,
    /// Reject clocked operations concurrent with the latest edit of a node.
    pub causal_check: bool,
    pub inactivity_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub disposal_grace_ms: u64,
    pub max_nodes: usize,
    /// Recently applied operation ids remembered for idempotent replay.
    pub dedup_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            conflict_threshold_ms: 1_000,
            conflict_policy: ConflictPolicy::RecentWindow,
            causal_check: true,
            inactivity_timeout_ms: 5 * 60 * 1_000,
            sweep_interval_ms: 30_000,
            disposal_grace_ms: 30_000,
            max_nodes: 10_000,
            dedup_capacity: 1_024,
        }
    }
}

impl RoomConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn disposal_grace(&self) -> Duration {
        Duration::from_millis(self.disposal_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub participant_id: String,
    pub display_name: String,
}

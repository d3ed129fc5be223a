//! Runtime configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Durations are stored as milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Connection policy of the replication swarm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Connections this peer opens itself.
    pub originate_connections: usize,
    /// Upper bound on open connections, in either direction.
    pub max_peers: usize,
    /// Peers considered when choosing whom to connect to.
    pub sample_size: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            originate_connections: 2,
            max_peers: 4,
            sample_size: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub topology: TopologyConfig,
    /// Bound on a whole auth exchange, including verification.
    pub auth_timeout_ms: u64,
    /// How long verification waits for an unknown peer's admission.
    pub verify_catch_up_ms: u64,
}

impl ProtocolConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn verify_catch_up(&self) -> Duration {
        Duration::from_millis(self.verify_catch_up_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::default(),
            auth_timeout_ms: 30_000,
            verify_catch_up_ms: 20_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Messages between automatic snapshots.
    pub snapshot_interval: u64,
    /// Where snapshots are kept. No snapshots are taken when unset.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
            snapshot_dir: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: ProtocolConfig,
    pub data: DataConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| ConfigError::DeserializationError(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Load from path if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

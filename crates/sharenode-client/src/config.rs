//! Node configuration

use serde::{Deserialize, Serialize};
use sharenode_core::DISCONNECT_TIMEOUT_MS;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Files shared at start-up
    pub shared: Vec<PathBuf>,

    /// Network configuration
    pub network: NetworkConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Key presented on connect and required from inbound connections
    pub handshake_key: String,
    /// Disconnect timeout; also bounds the handshake
    pub disconnect_timeout_ms: u64,
    /// How often the transport event queue is drained
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Where downloads are written
    pub download_dir: String,
    /// Throughput sampling period
    pub speed_tick_ms: u64,
    /// Number of samples in the smoothed throughput window
    pub speed_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.sharenode".to_string(),
            shared: vec![],
            network: NetworkConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_key: "sharenode".to_string(),
            disconnect_timeout_ms: DISCONNECT_TIMEOUT_MS,
            poll_interval_ms: 15,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: "~/.sharenode/downloads".to_string(),
            speed_tick_ms: 100,
            speed_window: 20,
        }
    }
}

impl NetworkConfig {
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// A peer must finish the key exchange within this window
    pub fn handshake_timeout(&self) -> Duration {
        self.disconnect_timeout()
    }

    /// Period of the missing-segment request timer
    pub fn retry_interval(&self) -> Duration {
        self.disconnect_timeout() / 2
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TransferConfig {
    pub fn speed_tick(&self) -> Duration {
        Duration::from_millis(self.speed_tick_ms)
    }

    /// Expand ~ in download_dir path
    pub fn download_dir(&self) -> PathBuf {
        expand_path(&self.download_dir)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

//! Storage node configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Settings of one storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Id announced to the file server
    pub node_id: String,
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Host the file server should use to reach this node
    pub advertise_address: String,
    /// Directory holding stored files
    pub data_dir: PathBuf,
    /// Space this node offers; free space is this minus stored bytes
    pub capacity_bytes: u64,
    /// File server to register with and send heartbeats to
    pub coordinator: Option<String>,
    /// Time between heartbeats
    pub heartbeat_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::from("node-1"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            advertise_address: String::from("127.0.0.1"),
            data_dir: PathBuf::from("/var/lib/replfs-node"),
            capacity_bytes: 100 * 1024 * 1024 * 1024,
            coordinator: None,
            heartbeat_interval_secs: 10,
        }
    }
}

impl NodeConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        if config.node_id.is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        if config.coordinator.is_some() && config.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be positive when a coordinator is set");
        }
        Ok(config)
    }
}

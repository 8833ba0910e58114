//! Server configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use replfs_cluster::{HealthConfig, NodeClientConfig, RecoveryConfig, ReplicationConfig};
use replfs_storage::{AssemblerConfig, MAX_VERSIONS};
use replfs_transport::{Backoff, RetryConfig, TcpTransportConfig, DEFAULT_CHUNK_SIZE, MAX_PAYLOAD_SIZE};

use crate::error::{Result, ServerError};

/// Replication engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Default replication factor
    pub factor: usize,
    /// Attempts per push target
    pub push_attempts: u32,
    /// Linear back-off step between push attempts
    pub push_backoff_ms: u64,
    /// Timeout of one push
    pub push_timeout_secs: u64,
    /// Tasks running at once
    pub max_concurrent: usize,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            factor: 3,
            push_attempts: 3,
            push_backoff_ms: 1000,
            push_timeout_secs: 30,
            max_concurrent: 8,
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Time between probe rounds
    pub probe_interval_secs: u64,
    /// Timeout of one probe
    pub probe_timeout_secs: u64,
    /// Silence after which a node is failed
    pub heartbeat_timeout_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
            heartbeat_timeout_secs: 60,
        }
    }
}

/// Fault-tolerance controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// Minimum time between recoveries of one node
    pub cooldown_secs: u64,
    /// Time between recovery sweeps
    pub sweep_interval_secs: u64,
    /// Tasks running at once
    pub max_concurrent: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            sweep_interval_secs: 300,
            max_concurrent: 4,
        }
    }
}

/// Chunked transfer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Largest accepted upload
    pub max_file_size: u64,
    /// Attempts per chunk write
    pub write_attempts: u32,
    /// Linear back-off step between chunk write attempts
    pub write_backoff_ms: u64,
    /// Idle read timeout of a connection
    pub read_timeout_ms: u64,
    /// Connections served at once
    pub max_connections: usize,
    /// Seconds without a chunk before a partial upload is dropped
    pub idle_transfer_secs: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: 1024 * 1024 * 1024,
            write_attempts: 3,
            write_backoff_ms: 100,
            read_timeout_ms: 30_000,
            max_connections: 256,
            idle_transfer_secs: 600,
        }
    }
}

/// Version history settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionSection {
    /// Versions retained per file
    pub max_versions: usize,
}

impl Default for VersionSection {
    fn default() -> Self {
        Self {
            max_versions: MAX_VERSIONS,
        }
    }
}

/// A storage node registered at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticNode {
    /// Node id
    pub node_id: String,
    /// Host of the node's HTTP interface
    pub address: String,
    /// HTTP port
    pub port: u16,
    /// Free space in bytes
    #[serde(default)]
    pub available_space: u64,
}

/// Top-level configuration of the file server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: SocketAddr,
    /// Directory holding live files and version history
    pub storage_root: PathBuf,
    /// Replication engine
    pub replication: ReplicationSection,
    /// Health monitor
    pub health: HealthSection,
    /// Fault-tolerance controller
    pub recovery: RecoverySection,
    /// Chunked transfers
    pub transfer: TransferSection,
    /// Version history
    pub versions: VersionSection,
    /// Nodes registered at startup
    pub nodes: Vec<StaticNode>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            storage_root: PathBuf::from("/var/lib/replfs"),
            replication: ReplicationSection::default(),
            health: HealthSection::default(),
            recovery: RecoverySection::default(),
            transfer: TransferSection::default(),
            versions: VersionSection::default(),
            nodes: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ServerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.replication.factor == 0 {
            return Err(ServerError::Config("replication factor must be at least 1".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(ServerError::Config("chunk size must be positive".into()));
        }
        if self.transfer.chunk_size as u64 > MAX_PAYLOAD_SIZE as u64 / 2 {
            return Err(ServerError::Config(format!(
                "chunk size {} does not fit a frame (max {})",
                self.transfer.chunk_size,
                MAX_PAYLOAD_SIZE / 2
            )));
        }
        if self.health.heartbeat_timeout_secs <= self.health.probe_interval_secs {
            return Err(ServerError::Config(format!(
                "heartbeat timeout ({}s) must exceed probe interval ({}s)",
                self.health.heartbeat_timeout_secs, self.health.probe_interval_secs
            )));
        }
        if self.transfer.idle_transfer_secs == 0 {
            return Err(ServerError::Config("idle_transfer_secs must be positive".into()));
        }
        if self.versions.max_versions == 0 {
            return Err(ServerError::Config("max_versions must be at least 1".into()));
        }
        Ok(())
    }

    /// Replication engine settings.
    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            default_factor: self.replication.factor,
            push_timeout: Duration::from_secs(self.replication.push_timeout_secs),
            retry: RetryConfig {
                max_attempts: self.replication.push_attempts.max(1),
                backoff: Backoff::Linear {
                    step: Duration::from_millis(self.replication.push_backoff_ms),
                },
                jitter: false,
            },
            max_concurrent: self.replication.max_concurrent,
        }
    }

    /// Health monitor settings.
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            probe_interval: Duration::from_secs(self.health.probe_interval_secs),
            probe_timeout: Duration::from_secs(self.health.probe_timeout_secs),
            heartbeat_timeout: Duration::from_secs(self.health.heartbeat_timeout_secs),
        }
    }

    /// Fault-tolerance controller settings.
    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            cooldown: Duration::from_secs(self.recovery.cooldown_secs),
            sweep_interval: Duration::from_secs(self.recovery.sweep_interval_secs),
            max_concurrent: self.recovery.max_concurrent,
        }
    }

    /// Chunk assembler settings.
    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            max_file_size: self.transfer.max_file_size,
            write_attempts: self.transfer.write_attempts.max(1),
            write_backoff: Backoff::Linear {
                step: Duration::from_millis(self.transfer.write_backoff_ms),
            },
            idle_timeout: Duration::from_secs(self.transfer.idle_transfer_secs),
        }
    }

    /// Node client timeouts; transfers share the push timeout.
    pub fn node_client_config(&self) -> NodeClientConfig {
        NodeClientConfig {
            health_timeout: Duration::from_secs(self.health.probe_timeout_secs),
            transfer_timeout: Duration::from_secs(self.replication.push_timeout_secs),
            ..Default::default()
        }
    }

    /// Listener transport settings.
    pub fn transport_config(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            read_timeout_ms: self.transfer.read_timeout_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 7070);
        assert_eq!(config.replication.factor, 3);
        assert_eq!(config.health.probe_interval_secs, 30);
        assert_eq!(config.health.heartbeat_timeout_secs, 60);
        assert_eq!(config.recovery.cooldown_secs, 300);
        assert_eq!(config.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.versions.max_versions, 10);
        assert!(config.nodes.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
bind_addr = "127.0.0.1:9000"
storage_root = "/tmp/replfs"

[replication]
factor = 2

[[nodes]]
node_id = "n1"
address = "10.0.0.1"
port = 8080
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.replication.factor, 2);
        assert_eq!(config.replication.push_attempts, 3);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].available_space, 0);
    }

    #[test]
    fn test_from_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"storage_root": "/data", "versions": {{"max_versions": 4}}}}"#).unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/data"));
        assert_eq!(config.versions.max_versions, 4);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_rejects_heartbeat_window_not_above_interval() {
        let mut config = ServerConfig::default();
        config.health.heartbeat_timeout_secs = config.health.probe_interval_secs;
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_factor_and_chunk_size() {
        let mut config = ServerConfig::default();
        config.replication.factor = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.transfer.chunk_size = MAX_PAYLOAD_SIZE as usize;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_conversions() {
        let mut config = ServerConfig::default();
        config.replication.push_backoff_ms = 250;
        config.recovery.cooldown_secs = 10;
        let repl = config.replication_config();
        assert_eq!(repl.default_factor, 3);
        assert_eq!(repl.retry.backoff.delay(2), Duration::from_millis(500));
        assert_eq!(config.recovery_config().cooldown, Duration::from_secs(10));
        assert_eq!(config.health_config().probe_timeout, Duration::from_secs(5));
        assert_eq!(config.assembler_config().max_file_size, 1024 * 1024 * 1024);
        assert_eq!(config.assembler_config().idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_rejects_zero_idle_transfer_window() {
        let mut config = ServerConfig::default();
        config.transfer.idle_transfer_secs = 0;
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }
}

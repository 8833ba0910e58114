//! Storage node model.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identifier of a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Creates an id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// The one health record kept per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Whether the node may receive new placements.
    pub healthy: bool,
    /// Last heartbeat or successful probe, epoch milliseconds.
    pub last_heartbeat_ms: u64,
    /// Logical paths this node holds a replica of.
    pub hosted_files: BTreeSet<String>,
    /// Failed probes since the last success.
    pub consecutive_failures: u32,
}

impl NodeStatus {
    /// A healthy record with a heartbeat at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            healthy: true,
            last_heartbeat_ms: now_ms,
            hosted_files: BTreeSet::new(),
            consecutive_failures: 0,
        }
    }
}

/// A storage node known to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node id.
    pub id: NodeId,
    /// Host name or IP address.
    pub address: String,
    /// HTTP port of the node's storage interface.
    pub port: u16,
    /// Free disk space reported by the node, in bytes.
    pub available_space: u64,
    /// Health record.
    pub status: NodeStatus,
}

impl Node {
    /// A healthy node registered now.
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            available_space: 0,
            status: NodeStatus::new(now_ms()),
        }
    }

    /// Sets the reported free space.
    pub fn with_available_space(mut self, bytes: u64) -> Self {
        self.available_space = bytes;
        self
    }

    /// `http://address:port` of the storage interface.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// Whether the node is currently healthy.
    pub fn is_healthy(&self) -> bool {
        self.status.healthy
    }
}

/// Metadata returned by a node's `/info` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node id
    pub node_id: String,
    /// Free disk space in bytes
    pub available_space: u64,
    /// Number of files stored
    pub file_count: u64,
    /// Bytes used by stored files
    pub used_bytes: u64,
}

/// Body of a node's `DELETE /files` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// True when a file was removed
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_is_healthy() {
        let node = Node::new("n1", "127.0.0.1", 9000).with_available_space(42);
        assert!(node.is_healthy());
        assert_eq!(node.available_space, 42);
        assert_eq!(node.base_url(), "http://127.0.0.1:9000");
        assert!(node.status.hosted_files.is_empty());
    }

    #[test]
    fn test_node_id_serializes_as_string() {
        let json = serde_json::to_string(&NodeId::new("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }
}

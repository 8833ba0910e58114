//! Error types for the cluster subsystem.

use thiserror::Error;

use replfs_transport::Transient;

use crate::node::NodeId;

/// Errors from registry, health, replication and recovery operations.
///
/// `Clone` so one replication outcome can be handed to every caller waiting
/// on the same in-flight task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The node is not registered.
    #[error("node not found: {node_id}")]
    NodeNotFound {
        /// Unknown node
        node_id: NodeId,
    },

    /// No healthy node lacks a copy of the file.
    #[error("no available nodes for {path} ({needed} replicas needed)")]
    NoAvailableNodes {
        /// File being replicated
        path: String,
        /// Replicas still missing
        needed: usize,
    },

    /// Every attempt to push to a node failed.
    #[error("transfer of {path} to {node_id} failed after {attempts} attempts: {reason}")]
    RemoteTransferFailed {
        /// Target node
        node_id: NodeId,
        /// File being pushed
        path: String,
        /// Attempts made
        attempts: u32,
        /// Last error
        reason: String,
    },

    /// Fewer pushes succeeded than were needed; successful ones stay recorded.
    #[error("replication of {path} incomplete: {pushed} of {needed} new replicas")]
    ReplicationIncomplete {
        /// File being replicated
        path: String,
        /// Successful pushes
        pushed: usize,
        /// Pushes needed
        needed: usize,
    },

    /// The target node was marked unhealthy while work was in progress.
    #[error("node {node_id} is unhealthy")]
    NodeUnhealthy {
        /// Node that went unhealthy
        node_id: NodeId,
    },

    /// Transport-level HTTP failure.
    #[error("HTTP error talking to {node_id}: {reason}")]
    Http {
        /// Remote node
        node_id: NodeId,
        /// Underlying error
        reason: String,
    },

    /// The node answered with a non-success status.
    #[error("node {node_id} answered {status} to {operation}")]
    RemoteStatus {
        /// Remote node
        node_id: NodeId,
        /// Request that failed
        operation: String,
        /// HTTP status code
        status: u16,
    },

    /// A remote call exceeded its timeout.
    #[error("{operation} on {node_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Remote node
        node_id: NodeId,
        /// Request that timed out
        operation: String,
        /// Timeout applied
        timeout_ms: u64,
    },

    /// No local copy and no healthy replica could supply the file's bytes.
    #[error("content for {path} is not available locally or on any replica")]
    ContentMissing {
        /// File without content
        path: String,
    },

    /// A replication factor below one was requested.
    #[error("invalid replication factor {factor} (minimum 1)")]
    InvalidFactor {
        /// Rejected value
        factor: usize,
    },

    /// Configuration values contradict each other.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The task producing a result went away.
    #[error("shutting down")]
    Shutdown,
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(e.to_string())
    }
}

impl Transient for ClusterError {
    fn is_transient(&self) -> bool {
        match self {
            ClusterError::Http { .. } | ClusterError::Timeout { .. } | ClusterError::Io(_) => true,
            ClusterError::RemoteStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

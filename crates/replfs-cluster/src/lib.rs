#![warn(missing_docs)]

//! replfs cluster subsystem: the node registry and its health events, the
//! health monitor, the replication engine that keeps every file at its target
//! replica count, and the fault-tolerance controller that repairs replica sets
//! after a node fails.

pub mod client;
pub mod error;
pub mod health;
pub mod node;
pub mod recovery;
pub mod registry;
pub mod replication;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{HttpNodeClient, NodeClient, NodeClientConfig};
pub use error::{ClusterError, ClusterResult};
pub use health::{ClusterHealth, HealthConfig, HealthMonitor};
pub use node::{now_ms, DeleteResponse, Node, NodeId, NodeInfo, NodeStatus};
pub use recovery::{
    FaultToleranceController, RecoveryConfig, RecoveryDecision, RecoveryReport, RecoveryState,
    RecoverySummary, SweepReport,
};
pub use registry::{spawn_listener, NodeEvent, NodeRegistry};
pub use replication::{
    ContentSource, LocalContentSource, ReplicationConfig, ReplicationEngine, ReplicationReport,
    ReplicationState, ReplicationStatus, SharedReplication,
};

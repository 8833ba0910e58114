//! Node health monitoring.
//!
//! Two signals feed node health: periodic probes of every registered node
//! (pull) and heartbeats sent by the nodes themselves (push). A node that
//! produces neither inside the heartbeat window is marked failed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::client::NodeClient;
use crate::error::{ClusterError, ClusterResult};
use crate::node::{now_ms, Node, NodeId};
use crate::registry::NodeRegistry;

/// Timing for probes and heartbeat expiry.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between probe rounds (default 30s).
    pub probe_interval: Duration,
    /// Timeout for one probe (default 5s).
    pub probe_timeout: Duration,
    /// A node silent for longer than this is failed (default 60s).
    pub heartbeat_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

impl HealthConfig {
    /// Rejects windows that a healthy node could not satisfy.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "probe interval and timeout must be positive".into(),
            ));
        }
        if self.heartbeat_timeout <= self.probe_interval {
            return Err(ClusterError::InvalidConfig(format!(
                "heartbeat timeout {:?} must exceed probe interval {:?}",
                self.heartbeat_timeout, self.probe_interval
            )));
        }
        Ok(())
    }
}

/// Cluster-wide health summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Registered nodes
    pub total_nodes: usize,
    /// Healthy nodes
    pub healthy_nodes: usize,
    /// Unhealthy nodes
    pub unhealthy_nodes: usize,
    /// Completed probe rounds since start
    pub probe_rounds: u64,
    /// Percentage of healthy nodes, 0 when no node is registered
    pub healthy_percentage: f64,
}

/// Probes nodes and applies heartbeats to the registry.
pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    client: Arc<dyn NodeClient>,
    config: HealthConfig,
    rounds: AtomicU64,
}

impl HealthMonitor {
    /// Creates a monitor after validating `config`.
    pub fn new(
        registry: Arc<NodeRegistry>,
        client: Arc<dyn NodeClient>,
        config: HealthConfig,
    ) -> ClusterResult<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            client,
            config,
            rounds: AtomicU64::new(0),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probes one node. Success refreshes its heartbeat; failure or timeout marks it unhealthy.
    pub async fn probe_node(&self, node: &Node) -> bool {
        let result = tokio::time::timeout(self.config.probe_timeout, self.client.health(node)).await;
        match result {
            Ok(Ok(())) => {
                if let Err(e) = self.registry.record_heartbeat(&node.id, now_ms(), None) {
                    tracing::debug!(node_id = %node.id, error = %e, "probed node vanished");
                }
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(node_id = %node.id, error = %e, "health probe failed");
                self.registry.mark_unhealthy(&node.id);
                false
            }
            Err(_) => {
                tracing::warn!(
                    node_id = %node.id,
                    timeout_ms = self.config.probe_timeout.as_millis() as u64,
                    "health probe timed out"
                );
                self.registry.mark_unhealthy(&node.id);
                false
            }
        }
    }

    /// Probes every registered node concurrently and returns the resulting summary.
    pub async fn probe_all(&self) -> ClusterHealth {
        let nodes = self.registry.list_all();
        let results = futures::future::join_all(nodes.iter().map(|n| self.probe_node(n))).await;
        let ok = results.iter().filter(|r| **r).count();
        self.rounds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(probed = nodes.len(), healthy = ok, "probe round complete");
        self.summary()
    }

    /// Applies a heartbeat pushed by a node.
    pub fn receive_heartbeat(&self, id: &NodeId, available_space: Option<u64>) -> ClusterResult<()> {
        if self.registry.record_heartbeat(id, now_ms(), available_space)? {
            tracing::info!(node_id = %id, "node restored by heartbeat");
        }
        Ok(())
    }

    /// Fails every healthy node whose last heartbeat is outside the window at `now_ms`.
    pub fn sweep_expired(&self, now_ms: u64) -> Vec<NodeId> {
        let timeout_ms = self.config.heartbeat_timeout.as_millis() as u64;
        let expired = self.registry.expired(now_ms, timeout_ms);
        for id in &expired {
            tracing::warn!(node_id = %id, timeout_ms, "heartbeat expired");
            self.registry.mark_unhealthy(id);
        }
        expired
    }

    /// Current counts from the registry.
    pub fn summary(&self) -> ClusterHealth {
        let nodes = self.registry.list_all();
        let total = nodes.len();
        let healthy = nodes.iter().filter(|n| n.is_healthy()).count();
        ClusterHealth {
            total_nodes: total,
            healthy_nodes: healthy,
            unhealthy_nodes: total - healthy,
            probe_rounds: self.rounds.load(Ordering::Relaxed),
            healthy_percentage: if total == 0 {
                0.0
            } else {
                healthy as f64 * 100.0 / total as f64
            },
        }
    }

    /// Probes and sweeps on every interval tick until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.probe_interval.as_millis() as u64,
            "health monitor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe_all().await;
                    self.sweep_expired(now_ms());
                }
            }
        }
        tracing::info!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNodeClient;
    use crate::registry::NodeEvent;

    fn setup(ids: &[&str]) -> (Arc<NodeRegistry>, Arc<MockNodeClient>, HealthMonitor) {
        let registry = Arc::new(NodeRegistry::new());
        for id in ids {
            registry.register(Node::new(*id, "127.0.0.1", 1));
        }
        let client = Arc::new(MockNodeClient::new());
        let monitor = HealthMonitor::new(registry.clone(), client.clone(), HealthConfig::default()).unwrap();
        (registry, client, monitor)
    }

    #[test]
    fn test_default_config_is_valid() {
        HealthConfig::default().validate().unwrap();
    }

    #[test]
    fn test_window_must_exceed_interval() {
        let config = HealthConfig {
            probe_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClusterError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_probe_failure_marks_unhealthy_then_restores() {
        let (registry, client, monitor) = setup(&["a", "b"]);
        let mut rx = registry.subscribe();
        client.set_down("b");
        let summary = monitor.probe_all().await;
        assert_eq!(summary.healthy_nodes, 1);
        assert_eq!(summary.unhealthy_nodes, 1);
        assert_eq!(summary.probe_rounds, 1);
        assert_eq!(summary.healthy_percentage, 50.0);
        assert_eq!(rx.recv().await.unwrap(), NodeEvent::Failed("b".into()));

        client.set_up("b");
        monitor.probe_all().await;
        assert!(registry.is_healthy(&"b".into()));
        assert_eq!(rx.recv().await.unwrap(), NodeEvent::Recovered("b".into()));
    }

    #[tokio::test]
    async fn test_heartbeat_restores_node() {
        let (registry, _client, monitor) = setup(&["a"]);
        registry.mark_unhealthy(&"a".into());
        monitor.receive_heartbeat(&"a".into(), Some(1234)).unwrap();
        let node = registry.get(&"a".into()).unwrap();
        assert!(node.is_healthy());
        assert_eq!(node.available_space, 1234);
        assert!(monitor.receive_heartbeat(&"nope".into(), None).is_err());
    }

    #[tokio::test]
    async fn test_sweep_fails_silent_nodes() {
        let (registry, _client, monitor) = setup(&["a", "b"]);
        let now = now_ms();
        monitor.receive_heartbeat(&"b".into(), None).unwrap();
        registry.record_heartbeat(&"b".into(), now + 100_000, None).unwrap();
        let failed = monitor.sweep_expired(now + 61_000);
        assert_eq!(failed, vec![NodeId::new("a")]);
        assert!(!registry.is_healthy(&"a".into()));
        assert!(registry.is_healthy(&"b".into()));
        // already unhealthy nodes are not reported twice
        assert!(monitor.sweep_expired(now + 62_000).is_empty());
    }

    #[tokio::test]
    async fn test_empty_cluster_summary() {
        let (_registry, _client, monitor) = setup(&[]);
        let s = monitor.summary();
        assert_eq!(s.total_nodes, 0);
        assert_eq!(s.healthy_percentage, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_probes_until_cancelled() {
        let (registry, client, monitor) = setup(&["a"]);
        let monitor = Arc::new(HealthMonitor {
            config: HealthConfig {
                probe_interval: Duration::from_secs(1),
                probe_timeout: Duration::from_millis(100),
                heartbeat_timeout: Duration::from_secs(3600),
            },
            ..monitor
        });
        client.set_down("a");
        let token = CancellationToken::new();
        let task = tokio::spawn(monitor.clone().run(token.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!registry.is_healthy(&"a".into()));
        assert!(monitor.summary().probe_rounds >= 2);
        token.cancel();
        task.await.unwrap();
    }
}

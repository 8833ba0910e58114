//! Fault-tolerance controller.
//!
//! Listens for node failures and restores the replica count of every file the
//! failed node held. Each node walks
//! `Healthy -> Unhealthy -> Recovering -> Healthy | Unhealthy`; a node whose
//! last recovery attempt is inside the cooldown window is skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ClusterError;
use crate::node::{now_ms, NodeId};
use crate::registry::{spawn_listener, NodeEvent, NodeRegistry};
use crate::replication::ReplicationEngine;

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Minimum time between two recoveries of one node (default 5 min).
    pub cooldown: Duration,
    /// Time between sweeps (default 5 min).
    pub sweep_interval: Duration,
    /// Node recoveries running at once (default 4).
    pub max_concurrent: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
            max_concurrent: 4,
        }
    }
}

/// Recovery lifecycle of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    /// Nothing to repair.
    Healthy,
    /// Failed, repair pending or last repair failed.
    Unhealthy,
    /// Repair running.
    Recovering,
}

#[derive(Debug, Clone)]
struct NodeRecovery {
    state: RecoveryState,
    last_attempt_ms: Option<u64>,
}

/// Result of recovering one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Failed node
    pub node_id: NodeId,
    /// Files that had a replica on it
    pub files: usize,
    /// Files back at their target factor
    pub restored: usize,
    /// Files still short, with the reason
    pub failed: Vec<(String, String)>,
}

impl RecoveryReport {
    /// True when every affected file was restored.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What a failure notification led to.
#[derive(Debug)]
pub enum RecoveryDecision {
    /// A recovery task was launched.
    Started(JoinHandle<RecoveryReport>),
    /// The node was recovered too recently; nothing was launched.
    InCooldown {
        /// Time until another attempt is allowed
        remaining: Duration,
    },
    /// A recovery of this node is already running.
    AlreadyRecovering,
}

/// Aggregate of a manual or sweep-driven recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    /// Reports of launched recoveries
    pub reports: Vec<RecoveryReport>,
    /// Nodes skipped because of the cooldown
    pub in_cooldown: Vec<NodeId>,
    /// Nodes already being recovered
    pub already_running: Vec<NodeId>,
}

impl RecoverySummary {
    /// Files restored across all reports.
    pub fn restored(&self) -> usize {
        self.reports.iter().map(|r| r.restored).sum()
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Nodes whose recovery was re-driven
    pub retried: Vec<NodeId>,
    /// Files the audit scheduled
    pub audited: Vec<String>,
}

/// Drives replica repair after node failures.
pub struct FaultToleranceController {
    registry: Arc<NodeRegistry>,
    engine: Arc<ReplicationEngine>,
    config: RecoveryConfig,
    records: DashMap<NodeId, NodeRecovery>,
    workers: Arc<Semaphore>,
    started: AtomicU64,
}

impl FaultToleranceController {
    /// Creates a controller; call [`run`](Self::run) to start listening.
    pub fn new(registry: Arc<NodeRegistry>, engine: Arc<ReplicationEngine>, config: RecoveryConfig) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            registry,
            engine,
            config,
            records: DashMap::new(),
            started: AtomicU64::new(0),
        }
    }

    /// Recovery state of `node_id`, `None` if it never failed.
    pub fn state(&self, node_id: &NodeId) -> Option<RecoveryState> {
        self.records.get(node_id).map(|r| r.state)
    }

    /// Number of recovery tasks launched so far.
    pub fn recoveries_started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Handles a failure of `node_id` observed at `now_ms`.
    pub fn on_node_failed(self: &Arc<Self>, node_id: &NodeId, now_ms: u64) -> RecoveryDecision {
        let cooldown_ms = self.config.cooldown.as_millis() as u64;
        {
            let mut rec = self.records.entry(node_id.clone()).or_insert(NodeRecovery {
                state: RecoveryState::Healthy,
                last_attempt_ms: None,
            });
            if rec.state == RecoveryState::Recovering {
                return RecoveryDecision::AlreadyRecovering;
            }
            rec.state = RecoveryState::Unhealthy;
            if let Some(last) = rec.last_attempt_ms {
                let elapsed = now_ms.saturating_sub(last);
                if elapsed < cooldown_ms {
                    let remaining = Duration::from_millis(cooldown_ms - elapsed);
                    tracing::info!(node_id = %node_id, remaining_ms = remaining.as_millis() as u64, "recovery in cooldown, skipping");
                    return RecoveryDecision::InCooldown { remaining };
                }
            }
            rec.last_attempt_ms = Some(now_ms);
            rec.state = RecoveryState::Recovering;
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(node_id = %node_id, "node failure, starting recovery");

        let this = self.clone();
        let node_id = node_id.clone();
        RecoveryDecision::Started(tokio::spawn(async move { this.recover_node(node_id).await }))
    }

    /// Marks a node's record healthy after the registry saw it come back.
    pub fn on_node_recovered(&self, node_id: &NodeId) {
        if let Some(mut rec) = self.records.get_mut(node_id) {
            if rec.state == RecoveryState::Unhealthy {
                rec.state = RecoveryState::Healthy;
            }
        }
    }

    /// Re-drives recovery for unhealthy nodes out of cooldown and audits every tracked file.
    pub fn check_and_recover(self: &Arc<Self>, now_ms: u64) -> SweepReport {
        let mut retried = Vec::new();
        for node_id in self.pending_nodes() {
            if let RecoveryDecision::Started(_) = self.on_node_failed(&node_id, now_ms) {
                retried.push(node_id);
            }
        }
        let audited = self.engine.audit();
        tracing::debug!(retried = retried.len(), audited = audited.len(), "recovery sweep complete");
        SweepReport { retried, audited }
    }

    /// Starts recovery for one node, or every unhealthy node, and waits for all of them.
    pub async fn initiate_recovery(self: &Arc<Self>, node_id: Option<NodeId>) -> RecoverySummary {
        let targets = match node_id {
            Some(id) => vec![id],
            None => self.pending_nodes(),
        };
        let now = now_ms();
        let mut summary = RecoverySummary::default();
        let mut handles = Vec::new();
        for id in targets {
            match self.on_node_failed(&id, now) {
                RecoveryDecision::Started(h) => handles.push((id, h)),
                RecoveryDecision::InCooldown { .. } => summary.in_cooldown.push(id),
                RecoveryDecision::AlreadyRecovering => summary.already_running.push(id),
            }
        }
        for (id, handle) in handles {
            let report = match handle.await {
                Ok(r) => r,
                Err(e) => RecoveryReport {
                    node_id: id,
                    files: 0,
                    restored: 0,
                    failed: vec![(String::new(), format!("recovery task failed: {}", e))],
                },
            };
            summary.reports.push(report);
        }
        summary
    }

    /// Listens for registry events and sweeps periodically until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let this = self.clone();
        let listener = spawn_listener(&self.registry, "fault-tolerance", move |event| {
            let this = this.clone();
            async move {
                match event {
                    NodeEvent::Failed(id) => {
                        let _ = this.on_node_failed(&id, now_ms());
                    }
                    NodeEvent::Recovered(id) => this.on_node_recovered(&id),
                    NodeEvent::Registered(_) | NodeEvent::Unregistered(_) => {}
                }
                Ok::<(), ClusterError>(())
            }
        });

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; sweeps start one interval in.
        ticker.tick().await;
        tracing::info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            "fault-tolerance controller started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_and_recover(now_ms());
                }
            }
        }
        listener.abort();
        tracing::info!("fault-tolerance controller stopped");
    }

    fn pending_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .registry
            .list_all()
            .into_iter()
            .filter(|n| !n.is_healthy())
            .map(|n| n.id)
            .collect();
        for rec in self.records.iter() {
            if rec.state == RecoveryState::Unhealthy && !ids.contains(rec.key()) {
                ids.push(rec.key().clone());
            }
        }
        ids.sort();
        ids
    }

    async fn recover_node(&self, node_id: NodeId) -> RecoveryReport {
        let _permit = self.workers.clone().acquire_owned().await;
        let affected = self.engine.evict_node(&node_id).await;
        let rounds: Vec<_> = affected
            .iter()
            .map(|(path, factor)| self.engine.replicate(path, *factor))
            .collect();
        let results = futures::future::join_all(rounds).await;

        let mut report = RecoveryReport {
            node_id: node_id.clone(),
            files: affected.len(),
            restored: 0,
            failed: Vec::new(),
        };
        for ((path, _), result) in affected.into_iter().zip(results) {
            match result {
                Ok(_) => report.restored += 1,
                Err(e) => report.failed.push((path, e.to_string())),
            }
        }

        if let Some(mut rec) = self.records.get_mut(&node_id) {
            rec.state = if report.is_complete() {
                RecoveryState::Healthy
            } else {
                RecoveryState::Unhealthy
            };
        }
        if report.is_complete() {
            tracing::info!(node_id = %node_id, files = report.files, "recovery complete");
        } else {
            tracing::error!(node_id = %node_id, files = report.files, failed = report.failed.len(), "recovery incomplete");
        }
        report
    }
}

//! Replication engine.
//!
//! Keeps every tracked file at its target replica count. A replication round
//! reads the file once, picks healthy nodes that lack a copy and pushes to
//! them concurrently with bounded retries. Concurrent requests for the same
//! path share one in-flight round and its outcome.
//!
//! Replica sets are mutated under a per-path lock that is never held across a
//! network call. Partial progress is kept: a round that lands fewer copies
//! than needed reports failure but the copies it did land stay recorded.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;

use replfs_storage::StorageRoot;
use replfs_transport::{Backoff, RetryConfig, RetryExecutor, RetryOutcome};

use crate::client::NodeClient;
use crate::error::{ClusterError, ClusterResult};
use crate::node::{Node, NodeId};
use crate::registry::NodeRegistry;

/// Outcome shared by every caller of one replication round.
pub type SharedReplication = Shared<BoxFuture<'static, ClusterResult<ReplicationReport>>>;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Factor used when a caller does not give one (default 3).
    pub default_factor: usize,
    /// Timeout for a single push attempt (default 30s).
    pub push_timeout: Duration,
    /// Attempts and back-off per target (default 3 attempts, 1s linear).
    pub retry: RetryConfig,
    /// Replication rounds running at once (default 8).
    pub max_concurrent: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            default_factor: 3,
            push_timeout: Duration::from_secs(30),
            retry: RetryConfig {
                max_attempts: 3,
                backoff: Backoff::Linear {
                    step: Duration::from_secs(1),
                },
                jitter: false,
            },
            max_concurrent: 8,
        }
    }
}

/// Where a file's replica set stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    /// Tracked, no round has finished yet.
    Pending,
    /// A round is running.
    Replicating,
    /// At or above target.
    Satisfied,
    /// Below target after the last round.
    Degraded,
}

/// Replica-set record of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Logical path
    pub path: String,
    /// Nodes holding a copy
    pub node_ids: BTreeSet<NodeId>,
    /// First node that received a copy
    pub primary: Option<NodeId>,
    /// Desired number of copies
    pub target_factor: usize,
    /// Last change
    pub last_updated: DateTime<Utc>,
    /// Progress towards the target
    pub state: ReplicationState,
}

impl ReplicationStatus {
    fn new(path: &str, target_factor: usize) -> Self {
        Self {
            path: path.to_string(),
            node_ids: BTreeSet::new(),
            primary: None,
            target_factor,
            last_updated: Utc::now(),
            state: ReplicationState::Pending,
        }
    }

    /// Number of recorded copies.
    pub fn replica_count(&self) -> usize {
        self.node_ids.len()
    }

    fn settle(&mut self) {
        self.state = if self.node_ids.len() >= self.target_factor {
            ReplicationState::Satisfied
        } else {
            ReplicationState::Degraded
        };
        self.last_updated = Utc::now();
    }
}

/// Result of a successful round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    /// Logical path
    pub path: String,
    /// Nodes that received a copy in this round
    pub pushed_to: Vec<NodeId>,
    /// Copies after the round
    pub replicas: usize,
    /// Target factor
    pub target_factor: usize,
}

/// Supplies the bytes of a file being replicated.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// The file's bytes, `None` when there is no local copy.
    async fn read(&self, path: &str) -> ClusterResult<Option<Bytes>>;
}

/// Reads files from the coordinator's storage root.
pub struct LocalContentSource {
    root: StorageRoot,
}

impl LocalContentSource {
    /// Reads under `root`.
    pub fn new(root: StorageRoot) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ContentSource for LocalContentSource {
    async fn read(&self, path: &str) -> ClusterResult<Option<Bytes>> {
        match self.root.read_file(path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(ClusterError::Io(e.to_string())),
        }
    }
}

/// Places and repairs replicas.
pub struct ReplicationEngine {
    registry: Arc<NodeRegistry>,
    client: Arc<dyn NodeClient>,
    content: Arc<dyn ContentSource>,
    config: ReplicationConfig,
    retry: RetryExecutor,
    statuses: DashMap<String, ReplicationStatus>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    in_flight: DashMap<String, SharedReplication>,
    workers: Arc<Semaphore>,
}

impl ReplicationEngine {
    /// Creates an engine.
    pub fn new(
        registry: Arc<NodeRegistry>,
        client: Arc<dyn NodeClient>,
        content: Arc<dyn ContentSource>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            retry: RetryExecutor::new(config.retry.clone()),
            workers: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            registry,
            client,
            content,
            config,
            statuses: DashMap::new(),
            locks: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Factor applied when none is given.
    pub fn default_factor(&self) -> usize {
        self.config.default_factor
    }

    /// Starts, or joins, a replication round for `path`.
    ///
    /// A pending status is recorded before this returns. The round runs on its
    /// own task; the returned future resolves to its outcome and may be
    /// dropped without cancelling it.
    pub fn replicate(self: &Arc<Self>, path: &str, factor: usize) -> SharedReplication {
        let factor = factor.max(1);
        self.statuses
            .entry(path.to_string())
            .or_insert_with(|| ReplicationStatus::new(path, factor));

        match self.in_flight.entry(path.to_string()) {
            Entry::Occupied(e) => {
                tracing::debug!(path, "joining in-flight replication");
                e.get().clone()
            }
            Entry::Vacant(v) => {
                let (tx, rx) = oneshot::channel();
                let shared = async move { rx.await.unwrap_or(Err(ClusterError::Shutdown)) }
                    .boxed()
                    .shared();
                v.insert(shared.clone());

                let engine = self.clone();
                let path = path.to_string();
                tokio::spawn(async move {
                    let result = match engine.workers.clone().acquire_owned().await {
                        Ok(_permit) => engine.run_round(&path, factor).await,
                        Err(_) => Err(ClusterError::Shutdown),
                    };
                    match &result {
                        Ok(r) => tracing::info!(path = %path, replicas = r.replicas, target = r.target_factor, pushed = r.pushed_to.len(), "replication round complete"),
                        Err(e) => tracing::warn!(path = %path, error = %e, "replication round failed"),
                    }
                    engine.in_flight.remove(&path);
                    let _ = tx.send(result);
                });
                shared
            }
        }
    }

    /// Replica-set record of `path`.
    pub fn status(&self, path: &str) -> Option<ReplicationStatus> {
        self.statuses.get(path).map(|s| s.value().clone())
    }

    /// Every tracked record, sorted by path.
    pub fn all_statuses(&self) -> Vec<ReplicationStatus> {
        let mut all: Vec<_> = self.statuses.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    /// Paths with a replica on `node_id`.
    pub fn files_on_node(&self, node_id: &NodeId) -> Vec<String> {
        self.registry.hosted_files(node_id)
    }

    /// Changes the target factor of `path`, replicating when it grew.
    ///
    /// Lowering the factor does not remove existing copies.
    pub async fn set_replication_factor(
        self: &Arc<Self>,
        path: &str,
        factor: usize,
    ) -> ClusterResult<Option<SharedReplication>> {
        if factor == 0 {
            return Err(ClusterError::InvalidFactor { factor });
        }
        let lock = self.lock_for(path);
        let below = {
            let _g = lock.lock().await;
            let mut st = self
                .statuses
                .entry(path.to_string())
                .or_insert_with(|| ReplicationStatus::new(path, factor));
            st.target_factor = factor;
            st.last_updated = Utc::now();
            st.node_ids.len() < factor
        };
        tracing::info!(path, factor, "replication factor changed");
        Ok(below.then(|| self.replicate(path, factor)))
    }

    /// Stops tracking `path` and deletes its remote copies in the background.
    ///
    /// The returned task yields each holder with whether its copy was removed.
    pub async fn handle_deletion(&self, path: &str) -> JoinHandle<Vec<(NodeId, bool)>> {
        let lock = self.lock_for(path);
        let holders: Vec<NodeId> = {
            let _g = lock.lock().await;
            let removed = self.statuses.remove(path).map(|(_, s)| s);
            let holders: Vec<NodeId> = removed.map(|s| s.node_ids.into_iter().collect()).unwrap_or_default();
            for id in &holders {
                self.registry.remove_hosted_file(id, path);
            }
            holders
        };
        tracing::info!(path, holders = holders.len(), "replica tracking removed");

        let nodes: Vec<(NodeId, Option<Node>)> = holders
            .into_iter()
            .map(|id| {
                let node = self.registry.get(&id);
                (id, node)
            })
            .collect();
        let client = self.client.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(nodes.len());
            for (id, node) in nodes {
                let ok = match node {
                    Some(node) => match client.delete_file(&node, &path).await {
                        Ok(removed) => removed,
                        Err(e) => {
                            tracing::warn!(node_id = %id, path = %path, error = %e, "remote delete failed");
                            false
                        }
                    },
                    None => false,
                };
                results.push((id, ok));
            }
            results
        })
    }

    /// Removes `node_id` from every replica set it is part of.
    ///
    /// Returns the affected paths with their target factors.
    pub async fn evict_node(&self, node_id: &NodeId) -> Vec<(String, usize)> {
        let mut affected = Vec::new();
        for path in self.registry.hosted_files(node_id) {
            let lock = self.lock_for(&path);
            let _g = lock.lock().await;
            self.registry.remove_hosted_file(node_id, &path);
            if let Some(mut st) = self.statuses.get_mut(&path) {
                st.node_ids.remove(node_id);
                if st.primary.as_ref() == Some(node_id) {
                    st.primary = st.node_ids.iter().next().cloned();
                }
                st.settle();
                affected.push((path.clone(), st.target_factor));
            }
        }
        if !affected.is_empty() {
            tracing::info!(node_id = %node_id, files = affected.len(), "node evicted from replica sets");
        }
        affected
    }

    /// Starts rounds for every tracked file below its target.
    ///
    /// Returns the paths that were scheduled.
    pub fn audit(self: &Arc<Self>) -> Vec<String> {
        let below: Vec<(String, usize)> = self
            .statuses
            .iter()
            .filter(|s| s.node_ids.len() < s.target_factor)
            .map(|s| (s.path.clone(), s.target_factor))
            .collect();
        for (path, factor) in &below {
            drop(self.replicate(path, *factor));
        }
        if !below.is_empty() {
            tracing::info!(files = below.len(), "audit scheduled under-replicated files");
        }
        below.into_iter().map(|(p, _)| p).collect()
    }

    async fn run_round(&self, path: &str, factor: usize) -> ClusterResult<ReplicationReport> {
        let lock = self.lock_for(path);
        let current: BTreeSet<NodeId> = {
            let _g = lock.lock().await;
            // Deleted between scheduling and this round.
            let Some(mut st) = self.statuses.get_mut(path) else {
                tracing::debug!(path, "file no longer tracked, round skipped");
                return Ok(self.report(path, Vec::new()));
            };
            st.target_factor = factor;
            st.state = ReplicationState::Replicating;
            st.node_ids.clone()
        };

        let needed = factor.saturating_sub(current.len());
        if needed == 0 {
            self.settle(path).await;
            return Ok(self.report(path, Vec::new()));
        }

        let candidates = self.candidates(&current);
        if candidates.is_empty() {
            self.settle(path).await;
            return Err(ClusterError::NoAvailableNodes {
                path: path.to_string(),
                needed,
            });
        }
        let targets: Vec<Node> = candidates.into_iter().take(needed).collect();

        let data = match self.load_content(path, &current).await {
            Ok(d) => d,
            Err(e) => {
                self.settle(path).await;
                return Err(e);
            }
        };

        let results = futures::future::join_all(
            targets
                .iter()
                .map(|node| self.push_with_retry(node, path, data.clone())),
        )
        .await;

        let mut pushed = Vec::new();
        let mut orphaned = Vec::new();
        let mut last_error = None;
        {
            let _g = lock.lock().await;
            for (node, result) in targets.iter().zip(results) {
                match result {
                    Ok(()) => match self.statuses.get_mut(path) {
                        Some(mut st) => {
                            st.node_ids.insert(node.id.clone());
                            if st.primary.is_none() {
                                st.primary = Some(node.id.clone());
                            }
                            self.registry.add_hosted_file(&node.id, path);
                            pushed.push(node.id.clone());
                        }
                        None => orphaned.push(node),
                    },
                    Err(e) => {
                        tracing::warn!(path, node_id = %node.id, error = %e, "replica push failed");
                        last_error = Some(e);
                    }
                }
            }
            if let Some(mut st) = self.statuses.get_mut(path) {
                st.settle();
            }
        }

        if !orphaned.is_empty() {
            tracing::info!(path, copies = orphaned.len(), "file deleted during round, removing pushed copies");
            for node in orphaned {
                if let Err(e) = self.client.delete_file(node, path).await {
                    tracing::warn!(path, node_id = %node.id, error = %e, "orphaned copy not removed");
                }
            }
            return Ok(self.report(path, Vec::new()));
        }

        if pushed.len() >= needed {
            return Ok(self.report(path, pushed));
        }
        match (pushed.is_empty(), last_error) {
            (true, Some(e)) if targets.len() == 1 => Err(e),
            _ => Err(ClusterError::ReplicationIncomplete {
                path: path.to_string(),
                pushed: pushed.len(),
                needed,
            }),
        }
    }

    fn candidates(&self, holders: &BTreeSet<NodeId>) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .registry
            .list_healthy()
            .into_iter()
            .filter(|n| !holders.contains(&n.id))
            .collect();
        nodes.sort_by(|a, b| {
            b.available_space
                .cmp(&a.available_space)
                .then_with(|| a.id.cmp(&b.id))
        });
        nodes
    }

    async fn load_content(&self, path: &str, holders: &BTreeSet<NodeId>) -> ClusterResult<Bytes> {
        if let Some(data) = self.content.read(path).await? {
            return Ok(data);
        }
        for id in holders {
            let Some(node) = self.registry.get(id).filter(|n| n.is_healthy()) else {
                continue;
            };
            match self.client.get_file(&node, path).await {
                Ok(data) => {
                    tracing::debug!(path, node_id = %id, "content fetched from replica");
                    return Ok(data);
                }
                Err(e) => tracing::debug!(path, node_id = %id, error = %e, "replica fetch failed"),
            }
        }
        Err(ClusterError::ContentMissing {
            path: path.to_string(),
        })
    }

    async fn push_with_retry(&self, node: &Node, path: &str, data: Bytes) -> ClusterResult<()> {
        let timeout = self.config.push_timeout;
        let outcome = self
            .retry
            .execute(|attempt| {
                let data = data.clone();
                async move {
                    if attempt > 1 && !self.registry.is_healthy(&node.id) {
                        return Err(ClusterError::NodeUnhealthy {
                            node_id: node.id.clone(),
                        });
                    }
                    match tokio::time::timeout(timeout, self.client.put_file(node, path, data)).await {
                        Ok(r) => r,
                        Err(_) => Err(ClusterError::Timeout {
                            node_id: node.id.clone(),
                            operation: "push".into(),
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    }
                }
            })
            .await;
        match outcome {
            RetryOutcome::Success(()) => Ok(()),
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => Err(ClusterError::RemoteTransferFailed {
                node_id: node.id.clone(),
                path: path.to_string(),
                attempts,
                reason: last_error.to_string(),
            }),
        }
    }

    async fn settle(&self, path: &str) {
        let lock = self.lock_for(path);
        let _g = lock.lock().await;
        if let Some(mut st) = self.statuses.get_mut(path) {
            st.settle();
        }
    }

    fn report(&self, path: &str, pushed_to: Vec<NodeId>) -> ReplicationReport {
        let (replicas, target_factor) = self
            .statuses
            .get(path)
            .map(|s| (s.node_ids.len(), s.target_factor))
            .unwrap_or((0, 0));
        ReplicationReport {
            path: path.to_string(),
            pushed_to,
            replicas,
            target_factor,
        }
    }

    fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

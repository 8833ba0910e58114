//! Authoritative set of storage nodes and their health records.
//!
//! Health transitions are published on a broadcast channel. Each subscriber
//! owns its receiver, so a slow or failing subscriber never blocks the
//! registry or the other subscribers.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{ClusterError, ClusterResult};
use crate::node::{Node, NodeId};

const EVENT_CAPACITY: usize = 1024;

/// Health and membership changes published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A node was added.
    Registered(NodeId),
    /// A node was removed.
    Unregistered(NodeId),
    /// A node went from healthy to unhealthy.
    Failed(NodeId),
    /// A node went from unhealthy to healthy.
    Recovered(NodeId),
}

/// In-memory node table.
pub struct NodeRegistry {
    nodes: DashMap<NodeId, Node>,
    events: broadcast::Sender<NodeEvent>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            nodes: DashMap::new(),
            events,
        }
    }

    /// Adds a node. Returns true if it was not known before.
    ///
    /// Re-registering a known id refreshes its address, port and free space
    /// but keeps its health record.
    pub fn register(&self, node: Node) -> bool {
        let id = node.id.clone();
        let added = match self.nodes.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                let existing = e.get_mut();
                existing.address = node.address;
                existing.port = node.port;
                existing.available_space = node.available_space;
                false
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(node);
                true
            }
        };
        if added {
            tracing::info!(node_id = %id, "node registered");
            self.publish(NodeEvent::Registered(id));
        }
        added
    }

    /// Removes a node, returning its last record.
    pub fn unregister(&self, id: &NodeId) -> Option<Node> {
        let removed = self.nodes.remove(id).map(|(_, n)| n);
        if removed.is_some() {
            tracing::info!(node_id = %id, "node unregistered");
            self.publish(NodeEvent::Unregistered(id.clone()));
        }
        removed
    }

    /// Snapshot of one node.
    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    /// Snapshot of every node, ordered by id.
    pub fn list_all(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Snapshot of healthy nodes, ordered by id.
    pub fn list_healthy(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.status.healthy)
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no node is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `id` is registered and healthy.
    pub fn is_healthy(&self, id: &NodeId) -> bool {
        self.nodes.get(id).map(|n| n.status.healthy).unwrap_or(false)
    }

    /// Marks a node healthy. Returns true on an unhealthy to healthy transition.
    pub fn mark_healthy(&self, id: &NodeId) -> bool {
        let transitioned = match self.nodes.get_mut(id) {
            Some(mut n) => {
                n.status.consecutive_failures = 0;
                let was = n.status.healthy;
                n.status.healthy = true;
                !was
            }
            None => false,
        };
        if transitioned {
            tracing::info!(node_id = %id, "node recovered");
            self.publish(NodeEvent::Recovered(id.clone()));
        }
        transitioned
    }

    /// Marks a node unhealthy. Returns true on a healthy to unhealthy transition,
    /// which is the only case that publishes [`NodeEvent::Failed`].
    pub fn mark_unhealthy(&self, id: &NodeId) -> bool {
        let transitioned = match self.nodes.get_mut(id) {
            Some(mut n) => {
                n.status.consecutive_failures = n.status.consecutive_failures.saturating_add(1);
                let was = n.status.healthy;
                n.status.healthy = false;
                was
            }
            None => false,
        };
        if transitioned {
            tracing::warn!(node_id = %id, "node marked unhealthy");
            self.publish(NodeEvent::Failed(id.clone()));
        }
        transitioned
    }

    /// Refreshes a node's heartbeat and restores it if it was unhealthy.
    ///
    /// Returns true when the heartbeat caused a recovery.
    pub fn record_heartbeat(
        &self,
        id: &NodeId,
        now_ms: u64,
        available_space: Option<u64>,
    ) -> ClusterResult<bool> {
        {
            let mut n = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| ClusterError::NodeNotFound { node_id: id.clone() })?;
            n.status.last_heartbeat_ms = n.status.last_heartbeat_ms.max(now_ms);
            if let Some(space) = available_space {
                n.available_space = space;
            }
        }
        Ok(self.mark_healthy(id))
    }

    /// Healthy nodes whose last heartbeat is older than `timeout_ms` at `now_ms`.
    pub fn expired(&self, now_ms: u64, timeout_ms: u64) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.status.healthy && now_ms.saturating_sub(n.status.last_heartbeat_ms) > timeout_ms)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Records that `id` holds a replica of `path`.
    pub fn add_hosted_file(&self, id: &NodeId, path: &str) {
        if let Some(mut n) = self.nodes.get_mut(id) {
            n.status.hosted_files.insert(path.to_string());
        }
    }

    /// Forgets that `id` holds a replica of `path`.
    pub fn remove_hosted_file(&self, id: &NodeId, path: &str) {
        if let Some(mut n) = self.nodes.get_mut(id) {
            n.status.hosted_files.remove(path);
        }
    }

    /// Paths `id` holds a replica of, sorted.
    pub fn hosted_files(&self, id: &NodeId) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.status.hosted_files.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribes to node events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: NodeEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }
}

/// Runs `handler` for every event on its own task.
///
/// Handler errors and panics are logged and do not stop the listener. A lagging receiver
/// logs the number of skipped events and keeps going; the task ends when the
/// registry is dropped.
pub fn spawn_listener<F, Fut, E>(registry: &NodeRegistry, name: &'static str, handler: F) -> JoinHandle<()>
where
    F: Fn(NodeEvent) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut rx = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let run = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone()))) {
                        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                        Err(panic) => Err(panic),
                    };
                    match run {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::error!(listener = name, ?event, error = %e, "node event listener failed");
                        }
                        Err(panic) => {
                            tracing::error!(
                                listener = name,
                                ?event,
                                panic = panic_message(&*panic),
                                "node event listener panicked"
                            );
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(listener = name, skipped, "node event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!(listener = name, "node event listener stopped");
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn node(id: &str) -> Node {
        Node::new(id, "127.0.0.1", 9000)
    }

    #[test]
    fn test_register_is_idempotent() {
        let reg = NodeRegistry::new();
        assert!(reg.register(node("a")));
        assert!(!reg.register(node("a").with_available_space(10)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&"a".into()).unwrap().available_space, 10);
    }

    #[test]
    fn test_reregister_keeps_health() {
        let reg = NodeRegistry::new();
        reg.register(node("a"));
        reg.mark_unhealthy(&"a".into());
        reg.register(node("a"));
        assert!(!reg.is_healthy(&"a".into()));
    }

    #[test]
    fn test_list_healthy_filters() {
        let reg = NodeRegistry::new();
        for id in ["c", "a", "b"] {
            reg.register(node(id));
        }
        reg.mark_unhealthy(&"b".into());
        let all: Vec<_> = reg.list_all().into_iter().map(|n| n.id.0).collect();
        assert_eq!(all, vec!["a", "b", "c"]);
        let healthy: Vec<_> = reg.list_healthy().into_iter().map(|n| n.id.0).collect();
        assert_eq!(healthy, vec!["a", "c"]);
    }

    #[test]
    fn test_failed_event_only_on_transition() {
        let reg = NodeRegistry::new();
        reg.register(node("a"));
        let mut rx = reg.subscribe();
        assert!(reg.mark_unhealthy(&"a".into()));
        assert!(!reg.mark_unhealthy(&"a".into()));
        assert_eq!(rx.try_recv().unwrap(), NodeEvent::Failed("a".into()));
        assert!(rx.try_recv().is_err());
        assert_eq!(reg.get(&"a".into()).unwrap().status.consecutive_failures, 2);
    }

    #[test]
    fn test_recovered_event() {
        let reg = NodeRegistry::new();
        reg.register(node("a"));
        reg.mark_unhealthy(&"a".into());
        let mut rx = reg.subscribe();
        assert!(!reg.mark_healthy(&"b".into()));
        assert!(reg.mark_healthy(&"a".into()));
        assert!(!reg.mark_healthy(&"a".into()));
        assert_eq!(rx.try_recv().unwrap(), NodeEvent::Recovered("a".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_heartbeat_restores_and_updates_space() {
        let reg = NodeRegistry::new();
        reg.register(node("a"));
        reg.mark_unhealthy(&"a".into());
        assert!(reg.record_heartbeat(&"a".into(), now_ms_plus(0), Some(77)).unwrap());
        let n = reg.get(&"a".into()).unwrap();
        assert!(n.status.healthy);
        assert_eq!(n.available_space, 77);
        assert!(matches!(
            reg.record_heartbeat(&"zz".into(), 0, None),
            Err(ClusterError::NodeNotFound { .. })
        ));
    }

    fn now_ms_plus(ms: u64) -> u64 {
        crate::node::now_ms() + ms
    }

    #[test]
    fn test_expired() {
        let reg = NodeRegistry::new();
        reg.register(node("a"));
        reg.register(node("b"));
        let now = crate::node::now_ms();
        reg.record_heartbeat(&"b".into(), now + 50_000, None).unwrap();
        let expired = reg.expired(now + 61_000, 60_000);
        assert_eq!(expired, vec![NodeId::new("a")]);
    }

    #[test]
    fn test_hosted_files() {
        let reg = NodeRegistry::new();
        reg.register(node("a"));
        reg.add_hosted_file(&"a".into(), "x/1");
        reg.add_hosted_file(&"a".into(), "x/0");
        assert_eq!(reg.hosted_files(&"a".into()), vec!["x/0", "x/1"]);
        reg.remove_hosted_file(&"a".into(), "x/0");
        assert_eq!(reg.hosted_files(&"a".into()), vec!["x/1"]);
        assert!(reg.hosted_files(&"missing".into()).is_empty());
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_affect_others() {
        let reg = NodeRegistry::new();
        reg.register(node("a"));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let _bad = spawn_listener(&reg, "bad", |_| async { Err::<(), _>("boom") });
        let _good = spawn_listener(&reg, "good", move |ev| {
            let seen = seen2.clone();
            async move {
                if matches!(ev, NodeEvent::Failed(_)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok::<(), String>(())
            }
        });
        reg.mark_unhealthy(&"a".into());
        reg.mark_healthy(&"a".into());
        reg.mark_unhealthy(&"a".into());
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_listening() {
        let reg = NodeRegistry::new();
        reg.register(node("a"));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let listener = spawn_listener(&reg, "flaky", move |ev| {
            let seen = seen2.clone();
            async move {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("handler blew up on {:?}", ev);
                }
                Ok::<(), String>(())
            }
        });
        reg.mark_unhealthy(&"a".into());
        reg.mark_healthy(&"a".into());
        reg.mark_unhealthy(&"a".into());
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert!(!listener.is_finished());
    }

    #[tokio::test]
    async fn test_concurrent_mark_unhealthy_publishes_once() {
        let reg = Arc::new(NodeRegistry::new());
        reg.register(node("a"));
        let mut rx = reg.subscribe();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move { reg.mark_unhealthy(&"a".into()) }));
        }
        let mut transitions = 0;
        for h in handles {
            if h.await.unwrap() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
        assert_eq!(rx.recv().await.unwrap(), NodeEvent::Failed("a".into()));
        assert!(rx.try_recv().is_err());
    }
}

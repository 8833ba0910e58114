//! In-memory node client for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::client::NodeClient;
use crate::error::{ClusterError, ClusterResult};
use crate::node::{Node, NodeId, NodeInfo};

#[derive(Default)]
pub struct MockNodeClient {
    files: Mutex<HashMap<NodeId, HashMap<String, Bytes>>>,
    down: Mutex<HashSet<NodeId>>,
    flaky: Mutex<HashMap<NodeId, usize>>,
    pub puts: AtomicUsize,
}

impl MockNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request to `id` fails until `set_up`.
    pub fn set_down(&self, id: &str) {
        self.down.lock().unwrap().insert(NodeId::new(id));
    }

    pub fn set_up(&self, id: &str) {
        self.down.lock().unwrap().remove(&NodeId::new(id));
    }

    /// The next `failures` puts to `id` fail with a transient error.
    pub fn fail_next_puts(&self, id: &str, failures: usize) {
        self.flaky.lock().unwrap().insert(NodeId::new(id), failures);
    }

    pub fn has(&self, id: &str, path: &str) -> bool {
        self.files
            .lock()
            .unwrap()
            .get(&NodeId::new(id))
            .map(|m| m.contains_key(path))
            .unwrap_or(false)
    }

    pub fn seed(&self, id: &str, path: &str, data: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .entry(NodeId::new(id))
            .or_default()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
    }

    fn check_up(&self, node: &Node) -> ClusterResult<()> {
        if self.down.lock().unwrap().contains(&node.id) {
            Err(ClusterError::Http {
                node_id: node.id.clone(),
                reason: "connection refused".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn health(&self, node: &Node) -> ClusterResult<()> {
        self.check_up(node)
    }

    async fn put_file(&self, node: &Node, path: &str, data: Bytes) -> ClusterResult<()> {
        self.check_up(node)?;
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(left) = flaky.get_mut(&node.id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ClusterError::Http {
                        node_id: node.id.clone(),
                        reason: "reset".into(),
                    });
                }
            }
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .entry(node.id.clone())
            .or_default()
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn get_file(&self, node: &Node, path: &str) -> ClusterResult<Bytes> {
        self.check_up(node)?;
        self.files
            .lock()
            .unwrap()
            .get(&node.id)
            .and_then(|m| m.get(path).cloned())
            .ok_or_else(|| ClusterError::ContentMissing {
                path: path.to_string(),
            })
    }

    async fn delete_file(&self, node: &Node, path: &str) -> ClusterResult<bool> {
        self.check_up(node)?;
        Ok(self
            .files
            .lock()
            .unwrap()
            .get_mut(&node.id)
            .map(|m| m.remove(path).is_some())
            .unwrap_or(false))
    }

    async fn info(&self, node: &Node) -> ClusterResult<NodeInfo> {
        self.check_up(node)?;
        let files = self.files.lock().unwrap();
        let m = files.get(&node.id);
        Ok(NodeInfo {
            node_id: node.id.to_string(),
            available_space: node.available_space,
            file_count: m.map(|m| m.len() as u64).unwrap_or(0),
            used_bytes: m.map(|m| m.values().map(|b| b.len() as u64).sum()).unwrap_or(0),
        })
    }
}

//! Test harness: a file server plus storage nodes on localhost.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use replfs_cluster::NodeId;
use replfs_node::{NodeApi, NodeStore};
use replfs_server::{ClientConfig, FileServer, ReplfsClient, ServerConfig, ServerState};

/// Capacity each test node announces.
pub const NODE_CAPACITY: u64 = 1024 * 1024 * 1024;

/// One running storage node.
pub struct TestNode {
    id: String,
    port: u16,
    dir: TempDir,
    shutdown: CancellationToken,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestNode {
    /// Starts a node with its own data directory on an ephemeral port.
    pub async fn start(id: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let store = NodeStore::open(dir.path(), NODE_CAPACITY).await?;
        let api = Arc::new(NodeApi::new(id, store));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(api.serve(listener, shutdown.clone()));
        Ok(Self {
            id: id.to_string(),
            port,
            dir,
            shutdown,
            task: Some(task),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bytes this node holds for `path`, if any.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir.path().join(path)).ok()
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Stops serving and waits until the port is closed.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// A file server with a set of storage nodes.
pub struct TestCluster {
    server_dir: TempDir,
    state: Arc<ServerState>,
    client: ReplfsClient,
    nodes: Vec<TestNode>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<replfs_server::Result<()>>>,
}

impl TestCluster {
    /// Test timings: no periodic probes or sweeps, fast push retries.
    pub fn config(root: &Path, factor: usize) -> ServerConfig {
        let mut config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().expect("valid address"),
            storage_root: root.to_path_buf(),
            ..Default::default()
        };
        config.replication.factor = factor;
        config.replication.push_attempts = 2;
        config.replication.push_backoff_ms = 50;
        config.replication.push_timeout_secs = 5;
        config.health.probe_interval_secs = 3600;
        config.health.probe_timeout_secs = 2;
        config.health.heartbeat_timeout_secs = 7200;
        config.recovery.sweep_interval_secs = 3600;
        config.transfer.chunk_size = 64 * 1024;
        config
    }

    /// Starts a server with replication factor `factor` and nodes `ids`.
    pub async fn start(ids: &[&str], factor: usize) -> anyhow::Result<Self> {
        let server_dir = tempfile::tempdir()?;
        let server = FileServer::new(Self::config(server_dir.path(), factor)).await?;
        let listener = server.bind().await?;
        let addr = listener.local_addr()?.to_string();
        let state = server.state().clone();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.run(listener, token).await });

        let mut cluster = Self {
            server_dir,
            state,
            client: ReplfsClient::new(addr, ClientConfig::default()),
            nodes: Vec::new(),
            shutdown,
            server: Some(task),
        };
        for id in ids {
            cluster.add_node(id).await?;
        }
        // Let the background loops subscribe before tests start failing nodes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(cluster)
    }

    /// Starts a node and registers it over the wire.
    pub async fn add_node(&mut self, id: &str) -> anyhow::Result<()> {
        let node = TestNode::start(id).await?;
        self.client
            .register_node(id, "127.0.0.1", node.port(), NODE_CAPACITY)
            .await?;
        self.nodes.push(node);
        Ok(())
    }

    pub fn client(&self) -> &ReplfsClient {
        &self.client
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn server_root(&self) -> &Path {
        self.server_dir.path()
    }

    /// Node `id`. Panics when there is none.
    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .unwrap_or_else(|| panic!("no test node {}", id))
    }

    /// Stops node `id` without telling the server.
    pub async fn stop_node(&mut self, id: &str) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id() == id) {
            node.stop().await;
        }
    }

    /// Node ids currently recorded as holding `path`.
    pub fn replicas(&self, path: &str) -> BTreeSet<String> {
        self.state
            .engine
            .status(path)
            .map(|s| s.node_ids.iter().map(NodeId::to_string).collect())
            .unwrap_or_default()
    }

    /// Polls `check` until it holds or `timeout` passes.
    pub async fn wait_until<F: Fn(&Self) -> bool>(&self, timeout: Duration, check: F) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stops the server and every node.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.server.take() {
            let _ = task.await;
        }
        for node in &mut self.nodes {
            node.stop().await;
        }
    }
}

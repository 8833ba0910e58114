//! Server state and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use replfs_cluster::{
    ContentSource, FaultToleranceController, HealthMonitor, HttpNodeClient, LocalContentSource,
    Node, NodeClient, NodeRegistry, ReplicationEngine,
};
use replfs_storage::{ChunkAssembler, StorageRoot, VersionStore};
use replfs_transport::TcpTransport;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::handler::ConnectionHandler;

/// Everything a connection handler works against.
///
/// Transfer, lock and replication maps are owned here and shared by every
/// connection through an `Arc`.
pub struct ServerState {
    /// Active configuration
    pub config: ServerConfig,
    /// Live file tree
    pub root: StorageRoot,
    /// In-progress uploads
    pub assembler: ChunkAssembler,
    /// Version history
    pub versions: VersionStore,
    /// Known storage nodes
    pub registry: Arc<NodeRegistry>,
    /// Replica placement and repair
    pub engine: Arc<ReplicationEngine>,
    /// Probes and heartbeats
    pub monitor: Arc<HealthMonitor>,
    /// Recovery after node failure
    pub controller: Arc<FaultToleranceController>,
}

impl ServerState {
    /// Builds the state with the HTTP node client.
    pub async fn open(config: ServerConfig) -> Result<Self> {
        let client = HttpNodeClient::new(config.node_client_config())?;
        Self::with_client(config, Arc::new(client)).await
    }

    /// Builds the state with a caller-provided node client.
    pub async fn with_client(config: ServerConfig, client: Arc<dyn NodeClient>) -> Result<Self> {
        config.validate()?;
        let root = StorageRoot::open(&config.storage_root).await?;
        let versions = VersionStore::open(root.clone(), config.versions.max_versions).await?;
        let assembler = ChunkAssembler::new(root.clone(), config.assembler_config());

        let registry = Arc::new(NodeRegistry::new());
        let content: Arc<dyn ContentSource> = Arc::new(LocalContentSource::new(root.clone()));
        let engine = Arc::new(ReplicationEngine::new(
            registry.clone(),
            client.clone(),
            content,
            config.replication_config(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            client,
            config.health_config(),
        )?);
        let controller = Arc::new(FaultToleranceController::new(
            registry.clone(),
            engine.clone(),
            config.recovery_config(),
        ));

        for node in &config.nodes {
            registry.register(
                Node::new(node.node_id.as_str(), node.address.as_str(), node.port)
                    .with_available_space(node.available_space),
            );
        }

        Ok(Self {
            config,
            root,
            assembler,
            versions,
            registry,
            engine,
            monitor,
            controller,
        })
    }

    /// Starts a replication round for a file that just changed.
    ///
    /// Keeps the file's factor when it is already tracked.
    pub fn schedule_replication(&self, path: &str) {
        let factor = self
            .engine
            .status(path)
            .map(|s| s.target_factor)
            .unwrap_or_else(|| self.engine.default_factor());
        drop(self.engine.replicate(path, factor));
        tracing::debug!(path, factor, "replication scheduled");
    }

    /// Reclaims stalled uploads until `shutdown` fires.
    pub async fn sweep_transfers(self: Arc<Self>, shutdown: CancellationToken) {
        let idle = self.assembler.idle_timeout();
        let mut ticker = tokio::time::interval((idle / 2).max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reclaimed = self.assembler.sweep_idle(idle).await;
                    if !reclaimed.is_empty() {
                        tracing::info!(count = reclaimed.len(), "idle transfers reclaimed");
                    }
                }
            }
        }
    }
}

/// Accepts connections and runs the background health and recovery loops.
pub struct FileServer {
    state: Arc<ServerState>,
    transport: TcpTransport,
}

impl FileServer {
    /// Builds a server with the HTTP node client.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let state = ServerState::open(config).await?;
        Ok(Self::from_state(Arc::new(state)))
    }

    /// Wraps existing state.
    pub fn from_state(state: Arc<ServerState>) -> Self {
        let transport = TcpTransport::new(state.config.transport_config());
        Self { state, transport }
    }

    /// Shared state.
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.state.config.bind_addr.to_string();
        Ok(self.transport.listen(&addr).await?)
    }

    /// Serves `listener` until `shutdown` fires.
    ///
    /// Each connection carries one request and runs on its own task; at most
    /// `transfer.max_connections` run at once.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        let monitor = tokio::spawn(self.state.monitor.clone().run(shutdown.child_token()));
        let controller = tokio::spawn(self.state.controller.clone().run(shutdown.child_token()));
        let sweeper = tokio::spawn(self.state.clone().sweep_transfers(shutdown.child_token()));
        let limit = Arc::new(Semaphore::new(self.state.config.transfer.max_connections.max(1)));
        tracing::info!(
            addr = ?local,
            root = %self.state.root.path().display(),
            nodes = self.state.registry.len(),
            "file server listening"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limit.clone().acquire_owned() => {
                    permit.map_err(|_| ServerError::Config("connection limiter closed".into()))?
                }
            };
            let conn = tokio::select! {
                _ = shutdown.cancelled() => break,
                conn = self.transport.accept(&listener) => conn,
            };
            let conn = match conn {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let handler = ConnectionHandler::new(self.state.clone());
            tokio::spawn(async move {
                let _permit = permit;
                tracing::debug!(peer = %conn.peer_addr(), "connection accepted");
                if let Err(e) = handler.handle(&conn).await {
                    if e.is_disconnect() {
                        tracing::debug!(peer = %conn.peer_addr(), "peer went away");
                    } else {
                        tracing::warn!(peer = %conn.peer_addr(), error = %e, "connection failed");
                    }
                }
                let _ = conn.shutdown().await;
            });
        }

        let _ = tokio::join!(monitor, controller, sweeper);
        tracing::info!("file server stopped");
        Ok(())
    }
}

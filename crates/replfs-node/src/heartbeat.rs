//! Registration and heartbeats towards a file server.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use replfs_server::{ClientConfig, ErrorKind, ReplfsClient};

use crate::api::NodeApi;

/// Keeps this node registered and alive on a file server.
pub struct Heartbeater {
    client: ReplfsClient,
    api: Arc<NodeApi>,
    address: String,
    port: u16,
    interval: Duration,
}

impl Heartbeater {
    /// Announces `api` as reachable at `address:port` to the server at `coordinator`.
    pub fn new(coordinator: impl Into<String>, api: Arc<NodeApi>, address: impl Into<String>, port: u16, interval: Duration) -> Self {
        Self {
            client: ReplfsClient::new(coordinator, ClientConfig::default()),
            api,
            address: address.into(),
            port,
            interval,
        }
    }

    /// Registers this node; the server ignores repeats.
    pub async fn register(&self) -> replfs_server::Result<()> {
        let info = self.api.info();
        self.client
            .register_node(self.api.node_id(), &self.address, self.port, info.available_space)
            .await?;
        tracing::info!(node_id = %self.api.node_id(), coordinator = %self.client.addr(), "registered with file server");
        Ok(())
    }

    /// Sends one heartbeat, registering again if the server no longer knows this node.
    pub async fn beat(&self) -> replfs_server::Result<()> {
        let space = self.api.info().available_space;
        match self.client.heartbeat(self.api.node_id(), Some(space)).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(node_id = %self.api.node_id(), "file server forgot this node, registering again");
                self.register().await
            }
            other => other,
        }
    }

    /// Registers, then sends a heartbeat on every tick until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut registered = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let result = if registered { self.beat().await } else { self.register().await };
                    match result {
                        Ok(()) => registered = true,
                        Err(e) => tracing::warn!(node_id = %self.api.node_id(), error = %e, "file server unreachable"),
                    }
                }
            }
        }
        tracing::info!(node_id = %self.api.node_id(), "heartbeats stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeStore;
    use replfs_server::{FileServer, ServerConfig};

    #[tokio::test]
    async fn test_registers_and_reregisters() {
        let server_dir = tempfile::tempdir().unwrap();
        let node_dir = tempfile::tempdir().unwrap();
        let server = FileServer::new(ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            storage_root: server_dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = server.state().clone();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { server.run(listener, token).await });

        let store = NodeStore::open(node_dir.path(), 500).await.unwrap();
        let api = Arc::new(NodeApi::new("hb-node", store));
        let hb = Heartbeater::new(addr, api, "127.0.0.1", 1, Duration::from_secs(1));

        hb.register().await.unwrap();
        let node = state.registry.get(&"hb-node".into()).unwrap();
        assert_eq!(node.available_space, 500);
        assert_eq!(node.port, 1);

        state.registry.unregister(&"hb-node".into());
        hb.beat().await.unwrap();
        assert!(state.registry.get(&"hb-node".into()).is_some());
        shutdown.cancel();
    }
}

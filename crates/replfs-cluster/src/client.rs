//! HTTP client for the storage-node interface.
//!
//! Nodes expose `GET /health`, `POST|GET|DELETE /files?filePath=<path>` and
//! `GET /info`. Every request carries its own timeout.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ClusterError, ClusterResult};
use crate::node::{DeleteResponse, Node, NodeInfo};

/// Operations the coordinator performs against a storage node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Succeeds when the node answers its health endpoint with 2xx.
    async fn health(&self, node: &Node) -> ClusterResult<()>;

    /// Stores `data` at `path` on the node.
    async fn put_file(&self, node: &Node, path: &str, data: Bytes) -> ClusterResult<()>;

    /// Fetches `path` from the node. A missing file is [`ClusterError::ContentMissing`].
    async fn get_file(&self, node: &Node, path: &str) -> ClusterResult<Bytes>;

    /// Deletes `path` on the node, returning the node's success flag.
    async fn delete_file(&self, node: &Node, path: &str) -> ClusterResult<bool>;

    /// Reads the node's metadata.
    async fn info(&self, node: &Node) -> ClusterResult<NodeInfo>;
}

/// Timeouts for node requests.
#[derive(Debug, Clone)]
pub struct NodeClientConfig {
    /// Health probe timeout (default 5s).
    pub health_timeout: Duration,
    /// File upload/download/delete timeout (default 30s).
    pub transfer_timeout: Duration,
    /// Info request timeout (default 10s).
    pub info_timeout: Duration,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(5),
            transfer_timeout: Duration::from_secs(30),
            info_timeout: Duration::from_secs(10),
        }
    }
}

/// [`NodeClient`] over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    http: reqwest::Client,
    config: NodeClientConfig,
}

impl HttpNodeClient {
    /// Builds a client with the given timeouts.
    pub fn new(config: NodeClientConfig) -> ClusterResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.health_timeout)
            .build()
            .map_err(|e| ClusterError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn files_url(node: &Node) -> String {
        format!("{}/files", node.base_url())
    }

    fn map_err(node: &Node, operation: &str, timeout: Duration, e: reqwest::Error) -> ClusterError {
        if e.is_timeout() {
            ClusterError::Timeout {
                node_id: node.id.clone(),
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            ClusterError::Http {
                node_id: node.id.clone(),
                reason: e.to_string(),
            }
        }
    }

    fn check(node: &Node, operation: &str, resp: &reqwest::Response) -> ClusterResult<()> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ClusterError::RemoteStatus {
                node_id: node.id.clone(),
                operation: operation.to_string(),
                status: resp.status().as_u16(),
            })
        }
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn health(&self, node: &Node) -> ClusterResult<()> {
        let t = self.config.health_timeout;
        let resp = self
            .http
            .get(format!("{}/health", node.base_url()))
            .timeout(t)
            .send()
            .await
            .map_err(|e| Self::map_err(node, "health", t, e))?;
        Self::check(node, "health", &resp)
    }

    async fn put_file(&self, node: &Node, path: &str, data: Bytes) -> ClusterResult<()> {
        let t = self.config.transfer_timeout;
        let resp = self
            .http
            .post(Self::files_url(node))
            .query(&[("filePath", path)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .timeout(t)
            .send()
            .await
            .map_err(|e| Self::map_err(node, "put file", t, e))?;
        Self::check(node, "put file", &resp)?;
        tracing::debug!(node_id = %node.id, path, "file stored on node");
        Ok(())
    }

    async fn get_file(&self, node: &Node, path: &str) -> ClusterResult<Bytes> {
        let t = self.config.transfer_timeout;
        let resp = self
            .http
            .get(Self::files_url(node))
            .query(&[("filePath", path)])
            .timeout(t)
            .send()
            .await
            .map_err(|e| Self::map_err(node, "get file", t, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClusterError::ContentMissing {
                path: path.to_string(),
            });
        }
        Self::check(node, "get file", &resp)?;
        resp.bytes()
            .await
            .map_err(|e| Self::map_err(node, "get file", t, e))
    }

    async fn delete_file(&self, node: &Node, path: &str) -> ClusterResult<bool> {
        let t = self.config.transfer_timeout;
        let resp = self
            .http
            .delete(Self::files_url(node))
            .query(&[("filePath", path)])
            .timeout(t)
            .send()
            .await
            .map_err(|e| Self::map_err(node, "delete file", t, e))?;
        Self::check(node, "delete file", &resp)?;
        let body: DeleteResponse = resp
            .json()
            .await
            .map_err(|e| Self::map_err(node, "delete file", t, e))?;
        Ok(body.success)
    }

    async fn info(&self, node: &Node) -> ClusterResult<NodeInfo> {
        let t = self.config.info_timeout;
        let resp = self
            .http
            .get(format!("{}/info", node.base_url()))
            .timeout(t)
            .send()
            .await
            .map_err(|e| Self::map_err(node, "info", t, e))?;
        Self::check(node, "info", &resp)?;
        resp.json()
            .await
            .map_err(|e| Self::map_err(node, "info", t, e))
    }
}

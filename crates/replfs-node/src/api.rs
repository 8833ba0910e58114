//! The node HTTP interface.
//!
//! `GET /health`, `POST|GET|DELETE /files?filePath=<path>` and `GET /info`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use replfs_cluster::{DeleteResponse, NodeInfo};
use replfs_storage::StorageError;

use crate::config::NodeConfig;
use crate::store::NodeStore;

/// Largest body accepted on `POST /files`.
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(rename = "filePath")]
    file_path: String,
}

/// Shared state of the HTTP handlers.
pub struct NodeApi {
    node_id: String,
    store: NodeStore,
}

impl NodeApi {
    /// Serves `store` as node `node_id`.
    pub fn new(node_id: impl Into<String>, store: NodeStore) -> Self {
        Self {
            node_id: node_id.into(),
            store,
        }
    }

    /// Opens the data directory named by `config`.
    pub async fn from_config(config: &NodeConfig) -> anyhow::Result<Self> {
        let store = NodeStore::open(&config.data_dir, config.capacity_bytes).await?;
        Ok(Self::new(config.node_id.clone(), store))
    }

    /// Node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Metadata answered on `/info`.
    pub fn info(&self) -> NodeInfo {
        self.store.info(&self.node_id)
    }

    /// Routes of the node interface.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(
                "/files",
                get(get_file_handler)
                    .post(put_file_handler)
                    .delete(delete_file_handler),
            )
            .route("/info", get(info_handler))
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
            .with_state(self)
    }

    /// Serves on `listener` until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(node_id = %self.node_id, %addr, "node API listening");
        axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

fn storage_error(e: StorageError) -> Response {
    let status = match &e {
        StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
        StorageError::InvalidPath { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn put_file_handler(
    State(api): State<Arc<NodeApi>>,
    Query(q): Query<FileQuery>,
    body: Bytes,
) -> Response {
    match api.store.put(&q.file_path, &body).await {
        Ok(path) => {
            tracing::debug!(path = %path, size = body.len(), "file stored");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::warn!(path = %q.file_path, error = %e, "store failed");
            storage_error(e)
        }
    }
}

async fn get_file_handler(State(api): State<Arc<NodeApi>>, Query(q): Query<FileQuery>) -> Response {
    match api.store.get(&q.file_path).await {
        Ok(data) => (StatusCode::OK, data).into_response(),
        Err(e) => storage_error(e),
    }
}

async fn delete_file_handler(State(api): State<Arc<NodeApi>>, Query(q): Query<FileQuery>) -> Response {
    match api.store.delete(&q.file_path).await {
        Ok(success) => Json(DeleteResponse { success }).into_response(),
        Err(e) => storage_error(e),
    }
}

async fn info_handler(State(api): State<Arc<NodeApi>>) -> Json<NodeInfo> {
    Json(api.info())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    async fn api(dir: &std::path::Path) -> Arc<NodeApi> {
        let store = NodeStore::open(dir, 1_000_000).await.unwrap();
        Arc::new(NodeApi::new("n1", store))
    }

    fn request(method: Method, uri: &str, body: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    async fn body(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let router = api(dir.path()).await.router();
        let response = router.oneshot(request(Method::GET, "/health", b"")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path()).await;

        let response = api
            .clone()
            .router()
            .oneshot(request(Method::POST, "/files?filePath=docs%2Fa.txt", b"content"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(std::fs::read(dir.path().join("docs/a.txt")).unwrap(), b"content");

        let response = api
            .clone()
            .router()
            .oneshot(request(Method::GET, "/files?filePath=docs%2Fa.txt", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, b"content");

        let response = api
            .clone()
            .router()
            .oneshot(request(Method::GET, "/info", b""))
            .await
            .unwrap();
        let info: NodeInfo = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(info.node_id, "n1");
        assert_eq!(info.file_count, 1);
        assert_eq!(info.used_bytes, 7);

        let response = api
            .clone()
            .router()
            .oneshot(request(Method::DELETE, "/files?filePath=docs%2Fa.txt", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let deleted: DeleteResponse = serde_json::from_slice(&body(response).await).unwrap();
        assert!(deleted.success);

        let response = api
            .router()
            .oneshot(request(Method::GET, "/files?filePath=docs%2Fa.txt", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_missing_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let router = api(dir.path()).await.router();
        let response = router
            .oneshot(request(Method::DELETE, "/files?filePath=nothing", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let deleted: DeleteResponse = serde_json::from_slice(&body(response).await).unwrap();
        assert!(!deleted.success);
    }

    #[tokio::test]
    async fn test_escaping_path_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let router = api(dir.path()).await.router();
        let response = router
            .oneshot(request(Method::POST, "/files?filePath=..%2Fx", b"x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_query_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = api(dir.path()).await.router();
        let response = router.oneshot(request(Method::GET, "/files", b"")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

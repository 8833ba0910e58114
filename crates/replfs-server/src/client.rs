//! Client library for the connection protocol.
//!
//! Every request opens its own connection, mirroring the server's one
//! request per connection rule.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use replfs_cluster::{ClusterHealth, Node, RecoverySummary, ReplicationReport, ReplicationStatus};
use replfs_storage::{DirEntry, Version};
use replfs_transport::{
    Backoff, FileChunk, Opcode, RetryConfig, RetryExecutor, RetryOutcome, TcpConnection, TcpTransport,
    TcpTransportConfig,
};

use crate::error::{Result, ServerError};
use crate::message::{
    ChunkAck, Command, DownloadHeader, NodeHealthView, OperationResult, Payload, UploadTicket,
};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connect and read timeouts
    pub transport: TcpTransportConfig,
    /// Resend policy for chunks rejected with a checksum mismatch
    pub chunk_retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            // Forced replication answers only after its round finishes.
            transport: TcpTransportConfig {
                read_timeout_ms: 300_000,
                ..Default::default()
            },
            chunk_retry: RetryConfig {
                max_attempts: 3,
                backoff: Backoff::Linear {
                    step: Duration::from_millis(100),
                },
                jitter: false,
            },
        }
    }
}

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    /// Path the server stored the file at
    pub path: String,
    /// Transfer id
    pub file_id: String,
    /// Bytes sent
    pub size: u64,
    /// Chunks sent, not counting resends
    pub chunks: u32,
    /// Chunks that had to be sent again
    pub retransmits: u32,
}

/// Talks to one file server.
pub struct ReplfsClient {
    addr: String,
    transport: TcpTransport,
    retry: RetryExecutor,
    next_request: AtomicU64,
}

impl ReplfsClient {
    /// Creates a client for the server at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            addr: addr.into(),
            transport: TcpTransport::new(config.transport),
            retry: RetryExecutor::new(config.chunk_retry),
            next_request: AtomicU64::new(1),
        }
    }

    /// Server address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<(TcpConnection, u64)> {
        let conn = self.transport.connect(&self.addr).await?;
        Ok((conn, self.next_request.fetch_add(1, Ordering::Relaxed)))
    }

    /// Sends a command and returns the raw envelope, successful or not.
    pub async fn command(&self, command: Command) -> Result<OperationResult> {
        let (conn, request_id) = self.connect().await?;
        conn.send_message(Opcode::Command, request_id, &command).await?;
        let result = conn.recv_message(Opcode::CommandResult).await?;
        let _ = conn.shutdown().await;
        Ok(result)
    }

    /// Sends a command and turns a failed envelope into an error.
    async fn call(&self, command: Command) -> Result<Option<Payload>> {
        let result = self.command(command).await?;
        into_payload(result)
    }

    /// Sends one chunk and returns the server's acknowledgement.
    pub async fn send_chunk(&self, chunk: &FileChunk) -> Result<ChunkAck> {
        let (conn, request_id) = self.connect().await?;
        conn.send_message(Opcode::Chunk, request_id, chunk).await?;
        let ack = conn.recv_message(Opcode::ChunkAck).await?;
        let _ = conn.shutdown().await;
        Ok(ack)
    }

    /// Sends a chunk, resending it while the server reports a checksum mismatch.
    ///
    /// Returns the acknowledgement and the number of resends.
    async fn deliver_chunk(&self, chunk: &FileChunk) -> Result<(ChunkAck, u32)> {
        let outcome = self
            .retry
            .execute(|attempt| async move {
                let ack = self.send_chunk(chunk).await?;
                if ack.is_accepted() {
                    Ok((ack, attempt - 1))
                } else {
                    Err(ServerError::ChunkRejected {
                        index: ack.index,
                        status: ack.status,
                        message: ack.message,
                    })
                }
            })
            .await;
        match outcome {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { last_error, attempts } => {
                tracing::warn!(file_id = %chunk.file_id, index = chunk.index, attempts, error = %last_error, "chunk not accepted");
                Err(last_error)
            }
        }
    }

    async fn announce(&self, path: &str, size: u64) -> Result<UploadTicket> {
        match self
            .call(Command::UploadFile {
                path: path.to_string(),
                size,
            })
            .await?
        {
            Some(Payload::Upload(ticket)) => Ok(ticket),
            other => Err(unexpected("upload ticket", other)),
        }
    }

    async fn upload_from<R: AsyncRead + Unpin>(&self, remote: &str, size: u64, mut source: R) -> Result<UploadSummary> {
        let ticket = self.announce(remote, size).await?;
        let mut summary = UploadSummary {
            path: ticket.path.clone(),
            file_id: ticket.file_id.clone(),
            size,
            chunks: 0,
            retransmits: 0,
        };
        let mut remaining = size;
        for index in 0..ticket.total_chunks {
            let len = remaining.min(ticket.chunk_size as u64) as usize;
            let mut data = vec![0u8; len];
            source
                .read_exact(&mut data)
                .await
                .map_err(|e| ServerError::InvalidRequest(format!("reading upload source: {}", e)))?;
            remaining -= len as u64;

            let chunk = FileChunk::new(&ticket.file_id, &ticket.path, index, ticket.total_chunks, data);
            let (_, resends) = self.deliver_chunk(&chunk).await?;
            summary.chunks += 1;
            summary.retransmits += resends;
        }
        tracing::info!(path = %summary.path, size, chunks = summary.chunks, retransmits = summary.retransmits, "upload finished");
        Ok(summary)
    }

    /// Uploads an in-memory buffer to `remote`.
    pub async fn upload_bytes(&self, remote: &str, data: &[u8]) -> Result<UploadSummary> {
        self.upload_from(remote, data.len() as u64, data).await
    }

    /// Uploads a local file to `remote`, reading it one chunk at a time.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<UploadSummary> {
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| ServerError::InvalidRequest(format!("{}: {}", local.display(), e)))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| ServerError::InvalidRequest(format!("{}: {}", local.display(), e)))?
            .len();
        self.upload_from(remote, size, file).await
    }

    /// Opens a download and returns its header with the connection positioned at the first chunk.
    async fn open_download(&self, path: &str) -> Result<(TcpConnection, DownloadHeader)> {
        let (conn, request_id) = self.connect().await?;
        conn.send_message(
            Opcode::Command,
            request_id,
            &Command::DownloadFile {
                path: path.to_string(),
            },
        )
        .await?;
        let result: OperationResult = conn.recv_message(Opcode::CommandResult).await?;
        match into_payload(result)? {
            Some(Payload::Download(header)) => Ok((conn, header)),
            other => Err(unexpected("download header", other)),
        }
    }

    async fn next_verified_chunk(conn: &TcpConnection, header: &DownloadHeader, index: u32) -> Result<FileChunk> {
        let chunk: FileChunk = conn.recv_message(Opcode::Chunk).await?;
        let corrupt = |reason: String| ServerError::CorruptDownload {
            path: header.path.clone(),
            reason,
        };
        if chunk.index != index || chunk.file_id != header.file_id {
            return Err(corrupt(format!(
                "expected chunk {} of {}, got chunk {} of {}",
                index, header.file_id, chunk.index, chunk.file_id
            )));
        }
        chunk.verify().map_err(|e| corrupt(e.to_string()))?;
        Ok(chunk)
    }

    /// Downloads `path` into memory, verifying every chunk.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let (conn, header) = self.open_download(path).await?;
        let mut data = Vec::with_capacity(header.size as usize);
        for index in 0..header.total_chunks {
            let chunk = Self::next_verified_chunk(&conn, &header, index).await?;
            data.extend_from_slice(&chunk.data);
        }
        if data.len() as u64 != header.size {
            return Err(ServerError::CorruptDownload {
                path: header.path,
                reason: format!("received {} of {} bytes", data.len(), header.size),
            });
        }
        Ok(data)
    }

    /// Downloads `path` into `local`, returning the byte count.
    pub async fn download_to(&self, path: &str, local: &Path) -> Result<u64> {
        let (conn, header) = self.open_download(path).await?;
        let io = |e: std::io::Error| ServerError::InvalidRequest(format!("{}: {}", local.display(), e));
        let mut file = tokio::fs::File::create(local).await.map_err(io)?;
        let mut written = 0u64;
        for index in 0..header.total_chunks {
            let chunk = Self::next_verified_chunk(&conn, &header, index).await?;
            file.write_all(&chunk.data).await.map_err(io)?;
            written += chunk.data.len() as u64;
        }
        file.flush().await.map_err(io)?;
        if written != header.size {
            return Err(ServerError::CorruptDownload {
                path: header.path,
                reason: format!("received {} of {} bytes", written, header.size),
            });
        }
        Ok(written)
    }

    /// Lists a directory.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        match self.call(Command::ListDir { path: path.into() }).await? {
            Some(Payload::Entries(entries)) => Ok(entries),
            other => Err(unexpected("directory listing", other)),
        }
    }

    /// Creates a directory and its parents.
    pub async fn create_dir(&self, path: &str) -> Result<String> {
        path_payload(self.call(Command::CreateDir { path: path.into() }).await?)
    }

    /// Deletes a directory recursively.
    pub async fn delete_dir(&self, path: &str) -> Result<String> {
        path_payload(self.call(Command::DeleteDir { path: path.into() }).await?)
    }

    /// Deletes a file.
    pub async fn delete_file(&self, path: &str) -> Result<String> {
        path_payload(self.call(Command::DeleteFile { path: path.into() }).await?)
    }

    /// Moves `from` to `to`; returns the normalized pair.
    pub async fn move_entry(&self, from: &str, to: &str) -> Result<(String, String)> {
        moved_payload(
            self.call(Command::Move {
                from: from.into(),
                to: to.into(),
            })
            .await?,
        )
    }

    /// Renames an entry in place.
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<(String, String)> {
        moved_payload(
            self.call(Command::Rename {
                path: path.into(),
                new_name: new_name.into(),
            })
            .await?,
        )
    }

    /// Snapshots `path`.
    pub async fn create_version(&self, path: &str, creator: &str, comment: &str) -> Result<Version> {
        match self
            .call(Command::CreateVersion {
                path: path.into(),
                creator: creator.into(),
                comment: comment.into(),
            })
            .await?
        {
            Some(Payload::Version(v)) => Ok(v),
            other => Err(unexpected("version", other)),
        }
    }

    /// Versions of `path`, newest first.
    pub async fn list_versions(&self, path: &str) -> Result<Vec<Version>> {
        match self.call(Command::ListVersions { path: path.into() }).await? {
            Some(Payload::Versions(v)) => Ok(v),
            other => Err(unexpected("version list", other)),
        }
    }

    /// Restores a version; returns it with the automatic backup, if one was taken.
    pub async fn restore_version(&self, path: &str, version_id: &str) -> Result<(Version, Option<Version>)> {
        match self
            .call(Command::RestoreVersion {
                path: path.into(),
                version_id: version_id.into(),
            })
            .await?
        {
            Some(Payload::Restored { restored, backup }) => Ok((restored, backup)),
            other => Err(unexpected("restore outcome", other)),
        }
    }

    /// Deletes one version.
    pub async fn delete_version(&self, path: &str, version_id: &str) -> Result<Version> {
        match self
            .call(Command::DeleteVersion {
                path: path.into(),
                version_id: version_id.into(),
            })
            .await?
        {
            Some(Payload::Version(v)) => Ok(v),
            other => Err(unexpected("version", other)),
        }
    }

    /// Replica records for one path, or for every tracked file.
    pub async fn replication_status(&self, path: Option<&str>) -> Result<Vec<ReplicationStatus>> {
        match self
            .call(Command::ShowReplicationStatus {
                path: path.map(str::to_string),
            })
            .await?
        {
            Some(Payload::Replication(s)) => Ok(s),
            other => Err(unexpected("replication status", other)),
        }
    }

    /// Runs a replication round for `path` and waits for its outcome.
    pub async fn force_replication(&self, path: &str, factor: Option<usize>) -> Result<ReplicationReport> {
        match self
            .call(Command::ForceReplication {
                path: path.into(),
                factor,
            })
            .await?
        {
            Some(Payload::ReplicationReport(r)) => Ok(r),
            other => Err(unexpected("replication report", other)),
        }
    }

    /// Cluster summary and node table.
    pub async fn node_health(&self) -> Result<(ClusterHealth, Vec<Node>)> {
        match self.call(Command::ShowNodeHealth).await? {
            Some(Payload::Nodes(NodeHealthView { summary, nodes })) => Ok((summary, nodes)),
            other => Err(unexpected("node health", other)),
        }
    }

    /// Registers a storage node with the server.
    pub async fn register_node(&self, node_id: &str, address: &str, port: u16, available_space: u64) -> Result<()> {
        self.call(Command::RegisterNode {
            node_id: node_id.into(),
            address: address.into(),
            port,
            available_space,
        })
        .await?;
        Ok(())
    }

    /// Pushes a heartbeat for `node_id`.
    pub async fn heartbeat(&self, node_id: &str, available_space: Option<u64>) -> Result<()> {
        self.call(Command::Heartbeat {
            node_id: node_id.into(),
            available_space,
        })
        .await?;
        Ok(())
    }

    /// Recovers one node, or every unhealthy node.
    pub async fn recover(&self, node_id: Option<&str>) -> Result<RecoverySummary> {
        match self
            .call(Command::Recover {
                node_id: node_id.map(str::to_string),
            })
            .await?
        {
            Some(Payload::Recovery(s)) => Ok(s),
            other => Err(unexpected("recovery summary", other)),
        }
    }
}

fn into_payload(result: OperationResult) -> Result<Option<Payload>> {
    if result.success {
        return Ok(result.payload);
    }
    Err(ServerError::Remote {
        kind: result.error.unwrap_or(crate::message::ErrorKind::Internal),
        message: result.message,
    })
}

fn unexpected(wanted: &str, got: Option<Payload>) -> ServerError {
    ServerError::InvalidRequest(format!("expected {} in response, got {:?}", wanted, got.map(|p| std::mem::discriminant(&p))))
}

fn path_payload(payload: Option<Payload>) -> Result<String> {
    match payload {
        Some(Payload::Path(p)) => Ok(p),
        other => Err(unexpected("path", other)),
    }
}

fn moved_payload(payload: Option<Payload>) -> Result<(String, String)> {
    match payload {
        Some(Payload::Moved { from, to }) => Ok((from, to)),
        other => Err(unexpected("move outcome", other)),
    }
}

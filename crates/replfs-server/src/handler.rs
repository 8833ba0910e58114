//! Per-connection request handling.

use std::sync::Arc;

use replfs_cluster::{ClusterError, Node, NodeId, ReplicationReport};
use replfs_storage::{normalize_path, ChunkProgress, ChunkReader, StorageError};
use replfs_transport::{chunk_count, FileChunk, Frame, Opcode, TcpConnection, TransportError};

use crate::error::{Result, ServerError};
use crate::message::{
    ChunkAck, ChunkStatus, Command, DownloadHeader, ErrorKind, NodeHealthView, OperationResult,
    Payload, UploadTicket,
};
use crate::server::ServerState;

/// What a command produced: an envelope, or an envelope followed by a chunk stream.
pub(crate) enum Reply {
    Done(OperationResult),
    Stream(OperationResult, ChunkReader),
}

/// Serves one connection against shared server state.
#[derive(Clone)]
pub struct ConnectionHandler {
    state: Arc<ServerState>,
}

impl ConnectionHandler {
    /// Creates a handler over `state`.
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Reads one request from `conn`, answers it and, for downloads, streams the file.
    pub async fn handle(&self, conn: &TcpConnection) -> Result<()> {
        let frame = conn.recv_frame().await?;
        match frame.opcode() {
            Opcode::Command => {
                let reply = match frame.decode_payload::<Command>() {
                    Ok(command) => self.dispatch(command).await,
                    Err(e) => Reply::Done(OperationResult::failed(
                        ErrorKind::InvalidRequest,
                        format!("undecodable command: {}", e),
                    )),
                };
                match reply {
                    Reply::Done(result) => respond(conn, &frame, Opcode::CommandResult, &result).await,
                    Reply::Stream(result, reader) => {
                        respond(conn, &frame, Opcode::CommandResult, &result).await?;
                        stream_file(conn, frame.header.request_id, reader).await
                    }
                }
            }
            Opcode::Chunk => {
                let ack = match frame.decode_payload::<FileChunk>() {
                    Ok(chunk) => self.accept_chunk(chunk).await,
                    Err(e) => ChunkAck {
                        file_id: String::new(),
                        index: 0,
                        status: ChunkStatus::Failed,
                        message: format!("undecodable chunk: {}", e),
                    },
                };
                respond(conn, &frame, Opcode::ChunkAck, &ack).await
            }
            other => Err(TransportError::UnexpectedOpcode {
                expected: Opcode::Command,
                got: other,
            }
            .into()),
        }
    }

    /// Runs a command and returns its envelope. Downloads are opened and then dropped.
    pub async fn execute(&self, command: Command) -> OperationResult {
        match self.dispatch(command).await {
            Reply::Done(result) | Reply::Stream(result, _) => result,
        }
    }

    /// Feeds one chunk to the assembler; a completed upload schedules replication.
    pub async fn accept_chunk(&self, chunk: FileChunk) -> ChunkAck {
        let (status, message) = match self.state.assembler.accept(&chunk).await {
            Ok(ChunkProgress::Accepted { .. }) => (ChunkStatus::Received, String::new()),
            Ok(ChunkProgress::Duplicate { .. }) => (ChunkStatus::Duplicate, String::new()),
            Ok(ChunkProgress::Completed { path, size }) => {
                self.state.schedule_replication(&path);
                (ChunkStatus::Completed, format!("{} ({} bytes) stored", path, size))
            }
            Err(e @ StorageError::ChecksumMismatch { .. }) => (ChunkStatus::ChecksumMismatch, e.to_string()),
            Err(e) => {
                tracing::warn!(file_id = %chunk.file_id, index = chunk.index, error = %e, "chunk rejected");
                (ChunkStatus::Failed, e.to_string())
            }
        };
        ChunkAck {
            file_id: chunk.file_id,
            index: chunk.index,
            status,
            message,
        }
    }

    pub(crate) async fn dispatch(&self, command: Command) -> Reply {
        let name = command.name();
        let outcome = match command {
            Command::ListDir { path } => self.list_dir(&path).await,
            Command::CreateDir { path } => self.create_dir(&path).await,
            Command::DeleteDir { path } => self.delete_dir(&path).await,
            Command::Move { from, to } => self.move_entry(&from, &to).await,
            Command::Rename { path, new_name } => self.rename(&path, &new_name).await,
            Command::UploadFile { path, size } => self.upload_file(&path, size).await,
            Command::DownloadFile { path } => return self.download_file(&path).await,
            Command::DeleteFile { path } => self.delete_file(&path).await,
            Command::CreateVersion {
                path,
                creator,
                comment,
            } => self.create_version(&path, &creator, &comment).await,
            Command::ListVersions { path } => self.list_versions(&path),
            Command::RestoreVersion { path, version_id } => self.restore_version(&path, &version_id).await,
            Command::DeleteVersion { path, version_id } => self.delete_version(&path, &version_id).await,
            Command::ShowReplicationStatus { path } => self.replication_status(path.as_deref()),
            Command::ForceReplication { path, factor } => self.force_replication(&path, factor).await,
            Command::ShowNodeHealth => Ok(self.node_health()),
            Command::RegisterNode {
                node_id,
                address,
                port,
                available_space,
            } => Ok(self.register_node(node_id, address, port, available_space)),
            Command::Heartbeat {
                node_id,
                available_space,
            } => self.heartbeat(node_id, available_space),
            Command::Recover { node_id } => self.recover(node_id).await,
        };
        Reply::Done(envelope(name, outcome))
    }

    async fn list_dir(&self, path: &str) -> Result<OperationResult> {
        let entries = self.state.root.list_dir(path).await?;
        Ok(OperationResult::ok(
            format!("{} entries", entries.len()),
            Some(Payload::Entries(entries)),
        ))
    }

    async fn create_dir(&self, path: &str) -> Result<OperationResult> {
        let logical = self.state.root.create_dir(path).await?;
        Ok(OperationResult::ok(
            format!("created {}", logical),
            Some(Payload::Path(logical)),
        ))
    }

    async fn delete_dir(&self, path: &str) -> Result<OperationResult> {
        let logical = self.state.root.delete_dir(path).await?;
        for tracked in self.tracked_under(&logical) {
            self.forget_replicas(&tracked).await;
        }
        Ok(OperationResult::ok(
            format!("deleted {}", logical),
            Some(Payload::Path(logical)),
        ))
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<OperationResult> {
        let (from, to) = self.state.root.move_entry(from, to).await?;
        self.relocate_replicas(&from, &to).await;
        Ok(OperationResult::ok(
            format!("moved {} to {}", from, to),
            Some(Payload::Moved { from, to }),
        ))
    }

    async fn rename(&self, path: &str, new_name: &str) -> Result<OperationResult> {
        let (from, to) = self.state.root.rename_entry(path, new_name).await?;
        self.relocate_replicas(&from, &to).await;
        Ok(OperationResult::ok(
            format!("renamed {} to {}", from, to),
            Some(Payload::Moved { from, to }),
        ))
    }

    async fn upload_file(&self, path: &str, size: u64) -> Result<OperationResult> {
        let (logical, _) = self.state.root.resolve_entry(path)?;
        let max = self.state.config.transfer.max_file_size;
        if size > max {
            return Err(ServerError::InvalidRequest(format!(
                "{} bytes exceeds the {} byte limit",
                size, max
            )));
        }
        let chunk_size = self.state.config.transfer.chunk_size;
        let total_chunks = chunk_count(size, chunk_size);
        if total_chunks == 0 {
            // No chunk will arrive to finalize an empty file.
            self.state.root.write_file(&logical, &[]).await?;
            self.state.schedule_replication(&logical);
        }
        let ticket = UploadTicket {
            file_id: uuid::Uuid::new_v4().to_string(),
            path: logical.clone(),
            chunk_size: chunk_size as u32,
            total_chunks,
        };
        tracing::info!(path = %logical, size, total_chunks, file_id = %ticket.file_id, "upload announced");
        Ok(OperationResult::ok(
            format!("send {} chunks for {}", total_chunks, logical),
            Some(Payload::Upload(ticket)),
        ))
    }

    async fn download_file(&self, path: &str) -> Reply {
        let file_id = uuid::Uuid::new_v4().to_string();
        let chunk_size = self.state.config.transfer.chunk_size;
        match ChunkReader::open(&self.state.root, path, file_id.clone(), chunk_size).await {
            Ok(reader) => {
                let header = DownloadHeader {
                    file_id,
                    path: reader.path().to_string(),
                    size: reader.size(),
                    total_chunks: reader.total_chunks(),
                };
                tracing::info!(path = %header.path, size = header.size, "download started");
                let result = OperationResult::ok(
                    format!("streaming {} chunks", header.total_chunks),
                    Some(Payload::Download(header)),
                );
                Reply::Stream(result, reader)
            }
            Err(e) => Reply::Done(envelope("download_file", Err(e.into()))),
        }
    }

    async fn delete_file(&self, path: &str) -> Result<OperationResult> {
        let logical = self.state.root.delete_file(path).await?;
        self.forget_replicas(&logical).await;
        Ok(OperationResult::ok(
            format!("deleted {}", logical),
            Some(Payload::Path(logical)),
        ))
    }

    async fn create_version(&self, path: &str, creator: &str, comment: &str) -> Result<OperationResult> {
        let version = self.state.versions.create_version(path, creator, comment).await?;
        Ok(OperationResult::ok(
            format!("version {} of {}", version.version_id, version.path),
            Some(Payload::Version(version)),
        ))
    }

    fn list_versions(&self, path: &str) -> Result<OperationResult> {
        let logical = normalize_path(path)?;
        let versions = self.state.versions.list_versions(&logical);
        Ok(OperationResult::ok(
            format!("{} versions of {}", versions.len(), logical),
            Some(Payload::Versions(versions)),
        ))
    }

    async fn restore_version(&self, path: &str, version_id: &str) -> Result<OperationResult> {
        let outcome = self.state.versions.restore_version(path, version_id).await?;
        let message = match &outcome.backup {
            Some(b) => format!(
                "restored {} to {}, previous content saved as {}",
                outcome.restored.path, version_id, b.version_id
            ),
            None => format!("restored {} to {}", outcome.restored.path, version_id),
        };
        Ok(OperationResult::ok(
            message,
            Some(Payload::Restored {
                restored: outcome.restored,
                backup: outcome.backup,
            }),
        ))
    }

    async fn delete_version(&self, path: &str, version_id: &str) -> Result<OperationResult> {
        let version = self.state.versions.delete_version(path, version_id).await?;
        Ok(OperationResult::ok(
            format!("deleted version {} of {}", version.version_id, version.path),
            Some(Payload::Version(version)),
        ))
    }

    fn replication_status(&self, path: Option<&str>) -> Result<OperationResult> {
        let statuses = match path {
            Some(p) => {
                let logical = normalize_path(p)?;
                let status = self
                    .state
                    .engine
                    .status(&logical)
                    .ok_or(StorageError::NotFound { path: logical })?;
                vec![status]
            }
            None => self.state.engine.all_statuses(),
        };
        Ok(OperationResult::ok(
            format!("{} tracked files", statuses.len()),
            Some(Payload::Replication(statuses)),
        ))
    }

    async fn force_replication(&self, path: &str, factor: Option<usize>) -> Result<OperationResult> {
        let logical = normalize_path(path)?;
        let engine = &self.state.engine;
        let tracked = engine.status(&logical);
        if tracked.is_none() && !self.state.root.is_file(&logical).await {
            return Err(StorageError::NotFound { path: logical }.into());
        }

        let round = match factor {
            Some(f) => engine.set_replication_factor(&logical, f).await?,
            None => {
                let f = tracked
                    .map(|s| s.target_factor)
                    .unwrap_or_else(|| engine.default_factor());
                Some(engine.replicate(&logical, f))
            }
        };
        let report = match round {
            Some(round) => round.await?,
            None => {
                let status = engine
                    .status(&logical)
                    .ok_or_else(|| ClusterError::ContentMissing { path: logical.clone() })?;
                ReplicationReport {
                    path: logical.clone(),
                    pushed_to: Vec::new(),
                    replicas: status.replica_count(),
                    target_factor: status.target_factor,
                }
            }
        };
        Ok(OperationResult::ok(
            format!("{} has {}/{} replicas", report.path, report.replicas, report.target_factor),
            Some(Payload::ReplicationReport(report)),
        ))
    }

    fn node_health(&self) -> OperationResult {
        let summary = self.state.monitor.summary();
        let nodes = self.state.registry.list_all();
        OperationResult::ok(
            format!("{}/{} nodes healthy", summary.healthy_nodes, summary.total_nodes),
            Some(Payload::Nodes(NodeHealthView { summary, nodes })),
        )
    }

    fn register_node(&self, node_id: String, address: String, port: u16, available_space: u64) -> OperationResult {
        let node = Node::new(node_id.as_str(), address, port).with_available_space(available_space);
        let added = self.state.registry.register(node);
        // A new node may be able to take replicas that found no target before.
        self.state.engine.audit();
        let message = if added {
            format!("node {} registered", node_id)
        } else {
            format!("node {} already registered", node_id)
        };
        OperationResult::ok(message, None)
    }

    fn heartbeat(&self, node_id: String, available_space: Option<u64>) -> Result<OperationResult> {
        let id = NodeId::new(node_id);
        self.state.monitor.receive_heartbeat(&id, available_space)?;
        Ok(OperationResult::ok(format!("heartbeat from {}", id), None))
    }

    async fn recover(&self, node_id: Option<String>) -> Result<OperationResult> {
        let target = match node_id {
            Some(id) => {
                let id = NodeId::new(id);
                if self.state.registry.get(&id).is_none() {
                    return Err(ClusterError::NodeNotFound { node_id: id }.into());
                }
                Some(id)
            }
            None => None,
        };
        let summary = self.state.controller.initiate_recovery(target).await;
        Ok(OperationResult::ok(
            format!(
                "{} recoveries, {} files restored, {} in cooldown",
                summary.reports.len(),
                summary.restored(),
                summary.in_cooldown.len()
            ),
            Some(Payload::Recovery(summary)),
        ))
    }

    /// Tracked paths equal to `prefix` or below it.
    fn tracked_under(&self, prefix: &str) -> Vec<String> {
        self.state
            .engine
            .all_statuses()
            .into_iter()
            .map(|s| s.path)
            .filter(|p| p == prefix || p.starts_with(&format!("{}/", prefix)))
            .collect()
    }

    async fn forget_replicas(&self, path: &str) {
        let task = self.state.engine.handle_deletion(path).await;
        let path = path.to_string();
        tokio::spawn(async move {
            if let Ok(results) = task.await {
                let failed = results.iter().filter(|(_, ok)| !ok).count();
                if failed > 0 {
                    tracing::warn!(path = %path, failed, "some remote copies were not removed");
                }
            }
        });
    }

    async fn relocate_replicas(&self, from: &str, to: &str) {
        for old in self.tracked_under(from) {
            let factor = self
                .state
                .engine
                .status(&old)
                .map(|s| s.target_factor)
                .unwrap_or_else(|| self.state.engine.default_factor());
            let new = format!("{}{}", to, &old[from.len()..]);
            self.forget_replicas(&old).await;
            drop(self.state.engine.replicate(&new, factor));
            tracing::debug!(from = %old, to = %new, "replicas relocated");
        }
    }
}

fn envelope(operation: &str, outcome: Result<OperationResult>) -> OperationResult {
    match outcome {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!(operation, error = %e, "command failed");
            OperationResult::failed(e.kind(), e.to_string())
        }
    }
}

async fn respond<T: serde::Serialize>(conn: &TcpConnection, request: &Frame, opcode: Opcode, message: &T) -> Result<()> {
    let payload = bincode::serialize(message).map_err(TransportError::from)?;
    conn.send_frame(&request.make_response(opcode, payload)).await?;
    Ok(())
}

async fn stream_file(conn: &TcpConnection, request_id: u64, mut reader: ChunkReader) -> Result<()> {
    let mut sent = 0u32;
    while let Some(chunk) = reader.next_chunk().await? {
        let frame = Frame::from_message(Opcode::Chunk, request_id, &chunk)?;
        conn.send_frame(&frame).await?;
        sent += 1;
    }
    tracing::debug!(path = %reader.path(), chunks = sent, "download streamed");
    Ok(())
}

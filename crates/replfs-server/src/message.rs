//! Messages carried by the connection protocol.
//!
//! A connection carries exactly one request: a [`Command`] frame answered by
//! an [`OperationResult`], or a chunk frame answered by a [`ChunkAck`]. A
//! successful download answer is followed by the file's chunk frames.

use serde::{Deserialize, Serialize};

use replfs_cluster::{ClusterHealth, Node, RecoverySummary, ReplicationReport, ReplicationStatus};
use replfs_storage::{DirEntry, Version};

/// Control operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// List a directory.
    ListDir {
        /// Directory path, empty for the root
        path: String,
    },
    /// Create a directory and its parents.
    CreateDir {
        /// Directory path
        path: String,
    },
    /// Delete a directory recursively.
    DeleteDir {
        /// Directory path
        path: String,
    },
    /// Move a file or directory.
    Move {
        /// Source path
        from: String,
        /// Destination path
        to: String,
    },
    /// Rename an entry in place.
    Rename {
        /// Entry path
        path: String,
        /// New final segment
        new_name: String,
    },
    /// Announce an upload; the answer carries the transfer id and chunk size.
    UploadFile {
        /// Destination path
        path: String,
        /// File size in bytes
        size: u64,
    },
    /// Download a file; chunk frames follow a successful answer.
    DownloadFile {
        /// File path
        path: String,
    },
    /// Delete a file and its remote replicas.
    DeleteFile {
        /// File path
        path: String,
    },
    /// Snapshot a file.
    CreateVersion {
        /// File path
        path: String,
        /// Who is asking
        creator: String,
        /// Free-form note
        comment: String,
    },
    /// List the versions of a file.
    ListVersions {
        /// File path
        path: String,
    },
    /// Restore a file to a version.
    RestoreVersion {
        /// File path
        path: String,
        /// Version to restore
        version_id: String,
    },
    /// Delete one version.
    DeleteVersion {
        /// File path
        path: String,
        /// Version to delete
        version_id: String,
    },
    /// Replica records, for one path or every tracked file.
    ShowReplicationStatus {
        /// File path, `None` for all
        path: Option<String>,
    },
    /// Run a replication round now and wait for it.
    ForceReplication {
        /// File path
        path: String,
        /// New target factor, `None` keeps the current one
        factor: Option<usize>,
    },
    /// Cluster health summary and node table.
    ShowNodeHealth,
    /// Add a storage node.
    RegisterNode {
        /// Node id
        node_id: String,
        /// Host or IP of the node's HTTP interface
        address: String,
        /// HTTP port
        port: u16,
        /// Free space in bytes
        available_space: u64,
    },
    /// Heartbeat pushed by a storage node.
    Heartbeat {
        /// Node id
        node_id: String,
        /// Free space in bytes, when known
        available_space: Option<u64>,
    },
    /// Recover one node, or every unhealthy node.
    Recover {
        /// Node id, `None` for all
        node_id: Option<String>,
    },
}

impl Command {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ListDir { .. } => "list_dir",
            Command::CreateDir { .. } => "create_dir",
            Command::DeleteDir { .. } => "delete_dir",
            Command::Move { .. } => "move",
            Command::Rename { .. } => "rename",
            Command::UploadFile { .. } => "upload_file",
            Command::DownloadFile { .. } => "download_file",
            Command::DeleteFile { .. } => "delete_file",
            Command::CreateVersion { .. } => "create_version",
            Command::ListVersions { .. } => "list_versions",
            Command::RestoreVersion { .. } => "restore_version",
            Command::DeleteVersion { .. } => "delete_version",
            Command::ShowReplicationStatus { .. } => "show_replication_status",
            Command::ForceReplication { .. } => "force_replication",
            Command::ShowNodeHealth => "show_node_health",
            Command::RegisterNode { .. } => "register_node",
            Command::Heartbeat { .. } => "heartbeat",
            Command::Recover { .. } => "recover",
        }
    }
}

/// Failure classes reported in result envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Path, version, node or content does not exist.
    NotFound,
    /// Destination already taken.
    AlreadyExists,
    /// Malformed or escaping path.
    InvalidPath,
    /// Payload did not match its checksum.
    ChecksumMismatch,
    /// Chunk failed validation.
    InvalidChunk,
    /// Writing a chunk failed after retries.
    ChunkProcessingFailed,
    /// No healthy node could take a replica.
    NoAvailableNodes,
    /// Pushing to or talking to a node failed.
    RemoteTransferFailed,
    /// The request itself is malformed.
    InvalidRequest,
    /// Anything else.
    Internal,
}

/// Answer to an upload announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTicket {
    /// Transfer id to put on every chunk
    pub file_id: String,
    /// Normalized destination path
    pub path: String,
    /// Chunk size the server expects
    pub chunk_size: u32,
    /// Number of chunks for the announced size
    pub total_chunks: u32,
}

/// Answer to a download request, sent before the chunk frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHeader {
    /// Transfer id carried by the chunks
    pub file_id: String,
    /// Normalized path
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Number of chunk frames that follow
    pub total_chunks: u32,
}

/// Cluster view returned by `ShowNodeHealth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealthView {
    /// Counts
    pub summary: ClusterHealth,
    /// Every registered node
    pub nodes: Vec<Node>,
}

/// Typed payload of a result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Directory listing.
    Entries(Vec<DirEntry>),
    /// A single normalized path.
    Path(String),
    /// Source and destination of a move or rename.
    Moved {
        /// Old path
        from: String,
        /// New path
        to: String,
    },
    /// Upload ticket.
    Upload(UploadTicket),
    /// Download header.
    Download(DownloadHeader),
    /// One version.
    Version(Version),
    /// Version list, newest first.
    Versions(Vec<Version>),
    /// Restore outcome.
    Restored {
        /// Version now live
        restored: Version,
        /// Backup of the replaced content
        backup: Option<Version>,
    },
    /// Replica records.
    Replication(Vec<ReplicationStatus>),
    /// Outcome of a forced round.
    ReplicationReport(ReplicationReport),
    /// Cluster health.
    Nodes(NodeHealthView),
    /// Recovery outcome.
    Recovery(RecoverySummary),
}

/// Envelope answering every command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// True only when the operation did what was asked
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Failure class when `success` is false
    pub error: Option<ErrorKind>,
    /// Typed result data
    pub payload: Option<Payload>,
}

impl OperationResult {
    /// A successful result.
    pub fn ok(message: impl Into<String>, payload: Option<Payload>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            payload,
        }
    }

    /// A failed result.
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(kind),
            payload: None,
        }
    }

    /// Attaches a payload to a result of either kind.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Status token of a chunk acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    /// Written; more chunks expected.
    Received,
    /// Already written earlier; not written again.
    Duplicate,
    /// Last chunk written; file finalized.
    Completed,
    /// Payload checksum mismatch; the chunk was discarded.
    ChecksumMismatch,
    /// Validation or write failure.
    Failed,
}

/// Answer to a chunk frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    /// Transfer id
    pub file_id: String,
    /// Chunk index
    pub index: u32,
    /// Outcome
    pub status: ChunkStatus,
    /// Detail for failures
    pub message: String,
}

impl ChunkAck {
    /// True for statuses that mean the chunk is on disk.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self.status,
            ChunkStatus::Received | ChunkStatus::Duplicate | ChunkStatus::Completed
        )
    }
}

use thiserror::Error;

use replfs_cluster::ClusterError;
use replfs_storage::StorageError;
use replfs_transport::{Transient, TransportError};

use crate::message::{ChunkStatus, ErrorKind};

/// Errors surfaced by the server and the client library.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server rejected request ({kind:?}): {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("chunk {index} rejected ({status:?}): {message}")]
    ChunkRejected {
        index: u32,
        status: ChunkStatus,
        message: String,
    },

    #[error("download of {path} is corrupt: {reason}")]
    CorruptDownload { path: String, reason: String },
}

impl ServerError {
    /// True when the peer closed or dropped the connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ServerError::Transport(e) if e.is_disconnect())
    }

    /// Classification carried in result envelopes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Storage(e) => match e {
                StorageError::NotFound { .. } | StorageError::VersionNotFound { .. } => ErrorKind::NotFound,
                StorageError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
                StorageError::InvalidPath { .. } => ErrorKind::InvalidPath,
                StorageError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
                StorageError::InvalidChunk { .. } => ErrorKind::InvalidChunk,
                StorageError::ChunkProcessingFailed { .. } => ErrorKind::ChunkProcessingFailed,
                StorageError::Catalog(_) | StorageError::Io(_) => ErrorKind::Internal,
            },
            ServerError::Cluster(e) => match e {
                ClusterError::NodeNotFound { .. } | ClusterError::ContentMissing { .. } => ErrorKind::NotFound,
                ClusterError::NoAvailableNodes { .. } => ErrorKind::NoAvailableNodes,
                ClusterError::RemoteTransferFailed { .. }
                | ClusterError::ReplicationIncomplete { .. }
                | ClusterError::NodeUnhealthy { .. }
                | ClusterError::Http { .. }
                | ClusterError::RemoteStatus { .. }
                | ClusterError::Timeout { .. } => ErrorKind::RemoteTransferFailed,
                ClusterError::InvalidFactor { .. } => ErrorKind::InvalidRequest,
                ClusterError::InvalidConfig(_) | ClusterError::Io(_) | ClusterError::Shutdown => ErrorKind::Internal,
            },
            ServerError::Transport(TransportError::InvalidChunk { .. }) => ErrorKind::InvalidChunk,
            ServerError::Transport(TransportError::ChunkChecksumMismatch { .. }) => ErrorKind::ChecksumMismatch,
            ServerError::Transport(_) => ErrorKind::Internal,
            ServerError::InvalidRequest(_) | ServerError::Config(_) => ErrorKind::InvalidRequest,
            ServerError::Remote { kind, .. } => *kind,
            ServerError::ChunkRejected { status, .. } => match status {
                ChunkStatus::ChecksumMismatch => ErrorKind::ChecksumMismatch,
                _ => ErrorKind::ChunkProcessingFailed,
            },
            ServerError::CorruptDownload { .. } => ErrorKind::ChecksumMismatch,
        }
    }
}

impl Transient for ServerError {
    fn is_transient(&self) -> bool {
        match self {
            ServerError::Transport(e) => e.is_transient(),
            ServerError::ChunkRejected { status, .. } => *status == ChunkStatus::ChecksumMismatch,
            _ => false,
        }
    }
}

/// Result alias for server and client operations.
pub type Result<T> = std::result::Result<T, ServerError>;

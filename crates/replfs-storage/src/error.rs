//! Error types for the storage subsystem.

use thiserror::Error;

use replfs_transport::Transient;

/// Errors from local storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The path does not exist under the storage root.
    #[error("not found: {path}")]
    NotFound {
        /// Logical path
        path: String,
    },

    /// A version id is unknown for the path.
    #[error("version {version_id} not found for {path}")]
    VersionNotFound {
        /// Logical path
        path: String,
        /// Requested version
        version_id: String,
    },

    /// The destination of a create or move is already taken.
    #[error("already exists: {path}")]
    AlreadyExists {
        /// Logical path
        path: String,
    },

    /// The path is malformed or escapes the storage root.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// Path as given
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// A chunk payload did not hash to its carried checksum.
    #[error("checksum mismatch for {file_id} chunk {index}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Transfer id
        file_id: String,
        /// Chunk index
        index: u32,
        /// Checksum sent with the chunk
        expected: String,
        /// Checksum of the received payload
        computed: String,
    },

    /// A chunk failed validation: empty, oversized, out of range or out of order.
    #[error("invalid chunk for {file_id}: {reason}")]
    InvalidChunk {
        /// Transfer id
        file_id: String,
        /// Why it was rejected
        reason: String,
    },

    /// Writing a chunk kept failing after the retry bound.
    #[error("chunk processing failed for {file_id}: {reason}")]
    ChunkProcessingFailed {
        /// Transfer id
        file_id: String,
        /// Last underlying error
        reason: String,
    },

    /// The version catalog could not be written.
    #[error("version catalog error: {0}")]
    Catalog(String),

    /// I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// True for both missing paths and unknown versions.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound { .. } | StorageError::VersionNotFound { .. }
        )
    }

    /// Maps an I/O error, turning `NotFound` into the typed variant for `path`.
    pub fn from_io(e: std::io::Error, path: &str) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound {
                path: path.to_string(),
            }
        } else {
            StorageError::Io(e)
        }
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

//! Reassembly of chunked uploads.
//!
//! Chunks for one transfer are serialized through a per-transfer lock. The
//! output file lives in the staging directory until the last chunk arrives,
//! then it is synced and renamed onto its final path. A transfer therefore
//! never leaves a half-written file at the logical path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use replfs_transport::{Backoff, FileChunk, TransportError};

use crate::error::{StorageError, StorageResult};
use crate::paths::StorageRoot;

/// Limits and retry policy for chunk writes.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Largest file a transfer may produce (default 1 GiB).
    pub max_file_size: u64,
    /// Write attempts per chunk before the transfer fails (default 3).
    pub write_attempts: u32,
    /// Delay schedule between write attempts (default linear 100ms).
    pub write_backoff: Backoff,
    /// A transfer with no chunk for this long is reclaimed (default 10 min).
    pub idle_timeout: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024 * 1024,
            write_attempts: 3,
            write_backoff: Backoff::Linear {
                step: Duration::from_millis(100),
            },
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// What happened to an accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkProgress {
    /// The chunk was written; more are expected.
    Accepted {
        /// Index just written
        index: u32,
        /// Chunks still missing
        remaining: u32,
    },
    /// The chunk had already been written and was acknowledged again.
    Duplicate {
        /// Re-sent index
        index: u32,
    },
    /// The last chunk was written and the file is in place.
    Completed {
        /// Normalized logical path
        path: String,
        /// Final size in bytes
        size: u64,
    },
}

/// Why a transfer stopped accepting chunks.
#[derive(Debug, Clone)]
enum Closed {
    Completed,
    Rejected(String),
    Failed(String),
    Abandoned,
}

struct TransferState {
    path: String,
    final_path: PathBuf,
    staging_path: PathBuf,
    total_chunks: u32,
    next_index: u32,
    bytes_written: u64,
    file: Option<File>,
    closed: Option<Closed>,
    last_activity: Instant,
}

/// Tracks every in-progress upload handled by this process.
pub struct ChunkAssembler {
    root: StorageRoot,
    config: AssemblerConfig,
    transfers: DashMap<String, Arc<Mutex<TransferState>>>,
}

impl ChunkAssembler {
    /// Creates an assembler writing under `root`.
    pub fn new(root: StorageRoot, config: AssemblerConfig) -> Self {
        Self {
            root,
            config,
            transfers: DashMap::new(),
        }
    }

    /// Number of transfers with an open state.
    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// Validates, verifies and writes one chunk.
    pub async fn accept(&self, chunk: &FileChunk) -> StorageResult<ChunkProgress> {
        chunk.validate().map_err(|e| invalid(&chunk.file_id, e))?;
        if let Err(TransportError::ChunkChecksumMismatch {
            index,
            expected,
            computed,
        }) = chunk.verify()
        {
            tracing::warn!(file_id = %chunk.file_id, index, "chunk checksum mismatch, discarding");
            return Err(StorageError::ChecksumMismatch {
                file_id: chunk.file_id.clone(),
                index,
                expected,
                computed,
            });
        }

        let (logical, final_path) = self.root.resolve_entry(&chunk.path)?;
        let state = self
            .transfers
            .entry(chunk.file_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TransferState {
                    path: logical.clone(),
                    final_path: final_path.clone(),
                    staging_path: self.root.staging_dir().join(&chunk.file_id),
                    total_chunks: chunk.total_chunks,
                    next_index: 0,
                    bytes_written: 0,
                    file: None,
                    closed: None,
                    last_activity: Instant::now(),
                }))
            })
            .value()
            .clone();

        let mut state = state.lock().await;
        // Set when another chunk closed the transfer while this one waited on the lock.
        match &state.closed {
            None => {}
            Some(Closed::Completed) => return Ok(ChunkProgress::Duplicate { index: chunk.index }),
            Some(Closed::Rejected(reason)) => {
                return Err(invalid_reason(
                    &chunk.file_id,
                    format!("transfer was discarded: {}", reason),
                ))
            }
            Some(Closed::Failed(reason)) => {
                return Err(StorageError::ChunkProcessingFailed {
                    file_id: chunk.file_id.clone(),
                    reason: format!("transfer was discarded: {}", reason),
                })
            }
            Some(Closed::Abandoned) => {
                return Err(invalid_reason(&chunk.file_id, "transfer was abandoned".into()))
            }
        }
        state.last_activity = Instant::now();
        if state.path != logical || state.total_chunks != chunk.total_chunks {
            return Err(invalid_reason(
                &chunk.file_id,
                format!(
                    "chunk describes {} ({} chunks) but transfer is {} ({} chunks)",
                    logical, chunk.total_chunks, state.path, state.total_chunks
                ),
            ));
        }
        if chunk.index < state.next_index {
            tracing::debug!(file_id = %chunk.file_id, index = chunk.index, "duplicate chunk acknowledged");
            return Ok(ChunkProgress::Duplicate { index: chunk.index });
        }
        if chunk.index > state.next_index {
            return Err(invalid_reason(
                &chunk.file_id,
                format!(
                    "out of order: expected chunk {}, got {}",
                    state.next_index, chunk.index
                ),
            ));
        }
        let new_size = state.bytes_written + chunk.data.len() as u64;
        if new_size > self.config.max_file_size {
            let reason = format!(
                "file would grow to {} bytes (max {})",
                new_size, self.config.max_file_size
            );
            self.discard(&chunk.file_id, &mut state, Closed::Rejected(reason.clone()))
                .await;
            return Err(invalid_reason(&chunk.file_id, reason));
        }

        self.write_with_retry(&chunk.file_id, &mut state, &chunk.data)
            .await?;
        state.next_index += 1;
        state.bytes_written = new_size;

        if !chunk.is_last() {
            return Ok(ChunkProgress::Accepted {
                index: chunk.index,
                remaining: state.total_chunks - state.next_index,
            });
        }

        if let Err(e) = self.finalize(&mut state).await {
            let reason = e.to_string();
            self.discard(&chunk.file_id, &mut state, Closed::Failed(reason.clone()))
                .await;
            return Err(StorageError::ChunkProcessingFailed {
                file_id: chunk.file_id.clone(),
                reason,
            });
        }
        state.closed = Some(Closed::Completed);
        self.transfers.remove(&chunk.file_id);
        tracing::info!(file_id = %chunk.file_id, path = %state.path, size = state.bytes_written, "upload complete");
        Ok(ChunkProgress::Completed {
            path: state.path.clone(),
            size: state.bytes_written,
        })
    }

    /// Drops a transfer and deletes its partial file.
    pub async fn abort(&self, file_id: &str) -> bool {
        let Some(state) = self.transfers.get(file_id).map(|s| s.value().clone()) else {
            return false;
        };
        let mut state = state.lock().await;
        if state.closed.is_some() {
            return false;
        }
        self.discard(file_id, &mut state, Closed::Abandoned).await;
        true
    }

    /// Aborts every transfer that has not seen a chunk for `idle`.
    ///
    /// Transfers whose lock is held are mid-chunk and are skipped. Returns the
    /// reclaimed transfer ids.
    pub async fn sweep_idle(&self, idle: Duration) -> Vec<String> {
        let candidates: Vec<(String, Arc<Mutex<TransferState>>)> = self
            .transfers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut reclaimed = Vec::new();
        for (file_id, state) in candidates {
            let Ok(mut state) = state.try_lock() else {
                continue;
            };
            if state.closed.is_some() || state.last_activity.elapsed() < idle {
                continue;
            }
            tracing::info!(
                file_id = %file_id,
                path = %state.path,
                received = state.next_index,
                total = state.total_chunks,
                "reclaiming idle transfer"
            );
            self.discard(&file_id, &mut state, Closed::Abandoned).await;
            reclaimed.push(file_id);
        }
        reclaimed
    }

    /// Idle limit from the configuration.
    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    async fn write_with_retry(
        &self,
        file_id: &str,
        state: &mut TransferState,
        data: &[u8],
    ) -> StorageResult<()> {
        let max = self.config.write_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match write_at(state, data).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max => {
                    tracing::warn!(file_id, attempt, error = %e, "chunk write failed, retrying");
                    state.file = None;
                    tokio::time::sleep(self.config.write_backoff.delay(attempt)).await;
                }
                Err(e) => {
                    tracing::error!(file_id, attempts = attempt, error = %e, "chunk write failed");
                    self.discard(file_id, state, Closed::Failed(e.to_string())).await;
                    return Err(StorageError::ChunkProcessingFailed {
                        file_id: file_id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn finalize(&self, state: &mut TransferState) -> std::io::Result<()> {
        if let Some(file) = state.file.take() {
            file.sync_all().await?;
        }
        if let Some(parent) = state.final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&state.staging_path, &state.final_path).await
    }

    async fn discard(&self, file_id: &str, state: &mut TransferState, closed: Closed) {
        state.file = None;
        state.closed = Some(closed);
        self.transfers.remove(file_id);
        if let Err(e) = tokio::fs::remove_file(&state.staging_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(file_id, error = %e, "failed to remove partial upload");
            }
        }
    }
}

async fn write_at(state: &mut TransferState, data: &[u8]) -> std::io::Result<()> {
    if state.file.is_none() {
        if let Some(parent) = state.staging_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(state.bytes_written == 0)
            .open(&state.staging_path)
            .await?;
        state.file = Some(file);
    }
    let offset = state.bytes_written;
    let file = state
        .file
        .as_mut()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "output handle missing"))?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

fn invalid(file_id: &str, e: TransportError) -> StorageError {
    match e {
        TransportError::InvalidChunk { reason } => invalid_reason(file_id, reason),
        other => invalid_reason(file_id, other.to_string()),
    }
}

fn invalid_reason(file_id: &str, reason: String) -> StorageError {
    StorageError::InvalidChunk {
        file_id: file_id.to_string(),
        reason,
    }
}

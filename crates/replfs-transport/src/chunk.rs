//! File chunks: the unit a file is streamed in.
//!
//! A file of `n` bytes is cut into `ceil(n / chunk_size)` chunks. Every chunk
//! carries its own SHA-256 so the receiver can reject a corrupted payload
//! without waiting for the rest of the file.

use serde::{Deserialize, Serialize};

use crate::checksum::sha256_hex;
use crate::error::{Result, TransportError};

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Longest accepted transfer identifier.
pub const MAX_FILE_ID_LEN: usize = 128;

/// True when `id` is usable as a single staging file name: ASCII
/// alphanumerics, `-` and `_`, at most [`MAX_FILE_ID_LEN`] bytes.
pub fn is_valid_file_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_FILE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// One checksummed slice of a file in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Transfer identifier shared by every chunk of one file.
    pub file_id: String,
    /// Logical path of the file relative to the storage root.
    pub path: String,
    /// Zero-based position of this chunk.
    pub index: u32,
    /// Number of chunks in the whole file.
    pub total_chunks: u32,
    /// Raw payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`, computed by the sender.
    pub checksum: String,
}

impl FileChunk {
    /// Builds a chunk and computes its checksum.
    pub fn new(
        file_id: impl Into<String>,
        path: impl Into<String>,
        index: u32,
        total_chunks: u32,
        data: Vec<u8>,
    ) -> Self {
        let checksum = sha256_hex(&data);
        Self {
            file_id: file_id.into(),
            path: path.into(),
            index,
            total_chunks,
            data,
            checksum,
        }
    }

    /// True for the chunk that finalizes the file.
    pub fn is_last(&self) -> bool {
        self.total_chunks > 0 && self.index + 1 == self.total_chunks
    }

    /// Structural checks that do not need the payload hash.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_file_id(&self.file_id) {
            return Err(TransportError::InvalidChunk {
                reason: format!("malformed file id {:?}", self.file_id),
            });
        }
        if self.data.is_empty() {
            return Err(TransportError::InvalidChunk {
                reason: format!("chunk {} has an empty payload", self.index),
            });
        }
        if self.index >= self.total_chunks {
            return Err(TransportError::InvalidChunk {
                reason: format!(
                    "chunk index {} out of range for {} chunks",
                    self.index, self.total_chunks
                ),
            });
        }
        Ok(())
    }

    /// Recomputes the payload hash and compares it with the carried checksum.
    pub fn verify(&self) -> Result<()> {
        let computed = sha256_hex(&self.data);
        if computed.eq_ignore_ascii_case(&self.checksum) {
            Ok(())
        } else {
            Err(TransportError::ChunkChecksumMismatch {
                index: self.index,
                expected: self.checksum.clone(),
                computed,
            })
        }
    }
}

/// Number of chunks needed for `len` bytes.
pub fn chunk_count(len: u64, chunk_size: usize) -> u32 {
    if len == 0 || chunk_size == 0 {
        return 0;
    }
    len.div_ceil(chunk_size as u64) as u32
}

/// Splits an in-memory buffer into checksummed chunks.
pub fn split_into_chunks(
    file_id: &str,
    path: &str,
    data: &[u8],
    chunk_size: usize,
) -> Vec<FileChunk> {
    let total = chunk_count(data.len() as u64, chunk_size);
    if total == 0 {
        return Vec::new();
    }
    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, slice)| FileChunk::new(file_id, path, i as u32, total, slice.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_computes_checksum() {
        let chunk = FileChunk::new("f1", "a/b.txt", 0, 1, b"payload".to_vec());
        assert_eq!(chunk.checksum, sha256_hex(b"payload"));
        assert!(chunk.verify().is_ok());
        assert!(chunk.is_last());
    }

    #[test]
    fn test_verify_detects_mutation() {
        let mut chunk = FileChunk::new("f1", "a.txt", 0, 2, b"payload".to_vec());
        chunk.data[0] ^= 0xFF;
        match chunk.verify() {
            Err(TransportError::ChunkChecksumMismatch { index, .. }) => assert_eq!(index, 0),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_payload() {
        let chunk = FileChunk::new("f1", "a.txt", 0, 1, Vec::new());
        assert!(matches!(
            chunk.validate(),
            Err(TransportError::InvalidChunk { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_path_like_file_ids() {
        for id in ["", "/tmp/planted.bin", "../escape", "a/b", "..", "x.y", "a\\b"] {
            let chunk = FileChunk::new(id, "a.txt", 0, 1, vec![1]);
            assert!(
                matches!(chunk.validate(), Err(TransportError::InvalidChunk { .. })),
                "accepted {:?}",
                id
            );
        }
        let long = "a".repeat(MAX_FILE_ID_LEN + 1);
        assert!(FileChunk::new(long, "a.txt", 0, 1, vec![1]).validate().is_err());
        let ticket = "6f1c2a9e-3b7d-4c1e-9a2f-0d5e8b7c6a41";
        assert!(FileChunk::new(ticket, "a.txt", 0, 1, vec![1]).validate().is_ok());
        assert!(FileChunk::new("t_1", "a.txt", 0, 1, vec![1]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_index_past_total() {
        let chunk = FileChunk::new("f1", "a.txt", 3, 3, vec![1]);
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn test_chunk_count_edges() {
        assert_eq!(chunk_count(0, 4), 0);
        assert_eq!(chunk_count(1, 4), 1);
        assert_eq!(chunk_count(4, 4), 1);
        assert_eq!(chunk_count(5, 4), 2);
    }

    #[test]
    fn test_split_empty_buffer() {
        assert!(split_into_chunks("f", "p", &[], 16).is_empty());
    }

    #[test]
    fn test_only_final_chunk_is_last() {
        let chunks = split_into_chunks("f", "p", &[7u8; 10], 4);
        assert_eq!(chunks.len(), 3);
        assert!(!chunks[0].is_last());
        assert!(!chunks[1].is_last());
        assert!(chunks[2].is_last());
        assert_eq!(chunks[2].data.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_split_reassembles(data in proptest::collection::vec(any::<u8>(), 1..4096), size in 1usize..512) {
            let chunks = split_into_chunks("f", "p", &data, size);
            prop_assert_eq!(chunks.len() as u32, chunk_count(data.len() as u64, size));
            let mut joined = Vec::with_capacity(data.len());
            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.index as usize, i);
                prop_assert!(c.validate().is_ok());
                prop_assert!(c.verify().is_ok());
                joined.extend_from_slice(&c.data);
            }
            prop_assert_eq!(joined, data);
        }
    }
}

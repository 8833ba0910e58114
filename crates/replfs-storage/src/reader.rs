//! Streams a stored file back out as checksummed chunks.

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use replfs_transport::{chunk_count, FileChunk};

use crate::error::{StorageError, StorageResult};
use crate::paths::StorageRoot;

/// Sequential chunk reader over one stored file.
pub struct ChunkReader {
    file: File,
    file_id: String,
    path: String,
    chunk_size: usize,
    size: u64,
    total_chunks: u32,
    next_index: u32,
}

impl ChunkReader {
    /// Opens `path` for download. Directories and missing files are `NotFound`.
    pub async fn open(
        root: &StorageRoot,
        path: &str,
        file_id: impl Into<String>,
        chunk_size: usize,
    ) -> StorageResult<Self> {
        let (logical, disk) = root.resolve_entry(path)?;
        let meta = tokio::fs::metadata(&disk)
            .await
            .map_err(|e| StorageError::from_io(e, &logical))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound { path: logical });
        }
        let file = File::open(&disk)
            .await
            .map_err(|e| StorageError::from_io(e, &logical))?;
        let size = meta.len();
        Ok(Self {
            file,
            file_id: file_id.into(),
            path: logical,
            chunk_size: chunk_size.max(1),
            size,
            total_chunks: chunk_count(size, chunk_size.max(1)),
            next_index: 0,
        })
    }

    /// File size in bytes at open time.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of chunks this reader will yield.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Normalized logical path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the next chunk, `None` once every chunk was produced.
    pub async fn next_chunk(&mut self) -> StorageResult<Option<FileChunk>> {
        if self.next_index >= self.total_chunks {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} shrank while being read", self.path),
            )));
        }
        buf.truncate(filled);
        let chunk = FileChunk::new(
            self.file_id.clone(),
            self.path.clone(),
            self.next_index,
            self.total_chunks,
            buf,
        );
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_all_chunks() {
        let dir = TempDir::new().unwrap();
        let root = StorageRoot::open(dir.path()).await.unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        tokio::fs::write(root.disk_path("f.bin"), &data).await.unwrap();

        let mut reader = ChunkReader::open(&root, "/f.bin", "d1", 300).await.unwrap();
        assert_eq!(reader.total_chunks(), 4);
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            chunk.verify().unwrap();
            out.extend_from_slice(&chunk.data);
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let root = StorageRoot::open(dir.path()).await.unwrap();
        let err = ChunkReader::open(&root, "nope.txt", "d", 10).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        let root = StorageRoot::open(dir.path()).await.unwrap();
        tokio::fs::create_dir(root.disk_path("sub")).await.unwrap();
        assert!(ChunkReader::open(&root, "sub", "d", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_file_has_no_chunks() {
        let dir = TempDir::new().unwrap();
        let root = StorageRoot::open(dir.path()).await.unwrap();
        tokio::fs::write(root.disk_path("e"), b"").await.unwrap();
        let mut reader = ChunkReader::open(&root, "e", "d", 10).await.unwrap();
        assert_eq!(reader.total_chunks(), 0);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }
}

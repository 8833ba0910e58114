//! Files stored on this node.

use std::path::PathBuf;

use dashmap::DashMap;

use replfs_cluster::NodeInfo;
use replfs_storage::paths::RESERVED_NAMES;
use replfs_storage::{StorageError, StorageResult, StorageRoot};

/// Directory-backed file store with an in-memory size index.
pub struct NodeStore {
    root: StorageRoot,
    capacity: u64,
    sizes: DashMap<String, u64>,
}

impl NodeStore {
    /// Opens `dir`, creating it if needed, and indexes the files already there.
    pub async fn open(dir: impl Into<PathBuf>, capacity: u64) -> StorageResult<Self> {
        let root = StorageRoot::open(dir).await?;
        let sizes = DashMap::new();
        let mut pending = vec![(String::new(), root.path().to_path_buf())];
        while let Some((prefix, dir)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if prefix.is_empty() && RESERVED_NAMES.contains(&name.as_str()) {
                    continue;
                }
                let logical = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push((logical, entry.path()));
                } else {
                    sizes.insert(logical, meta.len());
                }
            }
        }
        tracing::info!(root = %root.path().display(), files = sizes.len(), "node store opened");
        Ok(Self {
            root,
            capacity,
            sizes,
        })
    }

    /// Stores `data` at `path`, replacing any previous copy.
    pub async fn put(&self, path: &str, data: &[u8]) -> StorageResult<String> {
        let logical = self.root.write_file(path, data).await?;
        self.sizes.insert(logical.clone(), data.len() as u64);
        Ok(logical)
    }

    /// Bytes stored at `path`.
    pub async fn get(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.root.read_file(path).await
    }

    /// Removes `path`; false when there was nothing to remove.
    pub async fn delete(&self, path: &str) -> StorageResult<bool> {
        match self.root.delete_file(path).await {
            Ok(logical) => {
                self.sizes.remove(&logical);
                Ok(true)
            }
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Bytes held by stored files.
    pub fn used_bytes(&self) -> u64 {
        self.sizes.iter().map(|e| *e.value()).sum()
    }

    /// Metadata answered on `/info`.
    pub fn info(&self, node_id: &str) -> NodeInfo {
        let used = self.used_bytes();
        NodeInfo {
            node_id: node_id.to_string(),
            available_space: self.capacity.saturating_sub(used),
            file_count: self.sizes.len() as u64,
            used_bytes: used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path(), 1000).await.unwrap();
        assert_eq!(store.put("/a/b.txt", b"hello").await.unwrap(), "a/b.txt");
        assert_eq!(store.get("a/b.txt").await.unwrap(), b"hello");

        let info = store.info("n1");
        assert_eq!(info.file_count, 1);
        assert_eq!(info.used_bytes, 5);
        assert_eq!(info.available_space, 995);

        assert!(store.delete("a/b.txt").await.unwrap());
        assert!(!store.delete("a/b.txt").await.unwrap());
        assert!(store.get("a/b.txt").await.unwrap_err().is_not_found());
        assert_eq!(store.info("n1").file_count, 0);
    }

    #[tokio::test]
    async fn test_overwrite_updates_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path(), 1000).await.unwrap();
        store.put("f", b"0123456789").await.unwrap();
        store.put("f", b"01").await.unwrap();
        assert_eq!(store.used_bytes(), 2);
    }

    #[tokio::test]
    async fn test_reopen_indexes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = NodeStore::open(dir.path(), 1000).await.unwrap();
            store.put("x/y/z", b"abc").await.unwrap();
            store.put("top", b"d").await.unwrap();
        }
        let store = NodeStore::open(dir.path(), 1000).await.unwrap();
        let info = store.info("n1");
        assert_eq!(info.file_count, 2);
        assert_eq!(info.used_bytes, 4);
    }

    #[tokio::test]
    async fn test_escaping_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path(), 1000).await.unwrap();
        assert!(matches!(
            store.put("../evil", b"x").await,
            Err(StorageError::InvalidPath { .. })
        ));
    }
}

//! Directory and file operations on the storage root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::paths::{file_name, parent, StorageRoot, RESERVED_NAMES};

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Logical path
    pub path: String,
    /// True for directories
    pub is_dir: bool,
    /// Size in bytes, 0 for directories
    pub size: u64,
    /// Last modification time when the filesystem reports one
    pub modified: Option<DateTime<Utc>>,
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

impl StorageRoot {
    /// Lists a directory: directories first, then files, each sorted by name.
    pub async fn list_dir(&self, path: &str) -> StorageResult<Vec<DirEntry>> {
        let (logical, disk) = self.resolve(path)?;
        let meta = tokio::fs::metadata(&disk)
            .await
            .map_err(|e| StorageError::from_io(e, &logical))?;
        if !meta.is_dir() {
            return Err(StorageError::NotFound { path: logical });
        }
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(&disk).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if logical.is_empty() && RESERVED_NAMES.contains(&name.as_str()) {
                continue;
            }
            let meta = entry.metadata().await?;
            entries.push(DirEntry {
                path: join(&logical, &name),
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Creates a directory and any missing parents.
    pub async fn create_dir(&self, path: &str) -> StorageResult<String> {
        let (logical, disk) = self.resolve_entry(path)?;
        if let Ok(meta) = tokio::fs::metadata(&disk).await {
            if !meta.is_dir() {
                return Err(StorageError::AlreadyExists { path: logical });
            }
        }
        tokio::fs::create_dir_all(&disk).await?;
        tracing::debug!(path = %logical, "directory created");
        Ok(logical)
    }

    /// Removes a directory and everything below it.
    pub async fn delete_dir(&self, path: &str) -> StorageResult<String> {
        let (logical, disk) = self.resolve_entry(path)?;
        let meta = tokio::fs::metadata(&disk)
            .await
            .map_err(|e| StorageError::from_io(e, &logical))?;
        if !meta.is_dir() {
            return Err(StorageError::NotFound { path: logical });
        }
        tokio::fs::remove_dir_all(&disk).await?;
        tracing::debug!(path = %logical, "directory removed");
        Ok(logical)
    }

    /// Removes a single file.
    pub async fn delete_file(&self, path: &str) -> StorageResult<String> {
        let (logical, disk) = self.resolve_entry(path)?;
        let meta = tokio::fs::metadata(&disk)
            .await
            .map_err(|e| StorageError::from_io(e, &logical))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound { path: logical });
        }
        tokio::fs::remove_file(&disk)
            .await
            .map_err(|e| StorageError::from_io(e, &logical))?;
        Ok(logical)
    }

    /// Moves a file or directory. The destination must not exist.
    pub async fn move_entry(&self, from: &str, to: &str) -> StorageResult<(String, String)> {
        let (src, src_disk) = self.resolve_entry(from)?;
        let (dst, dst_disk) = self.resolve_entry(to)?;
        if tokio::fs::metadata(&src_disk).await.is_err() {
            return Err(StorageError::NotFound { path: src });
        }
        if tokio::fs::metadata(&dst_disk).await.is_ok() {
            return Err(StorageError::AlreadyExists { path: dst });
        }
        if dst.starts_with(&format!("{}/", src)) {
            return Err(StorageError::InvalidPath {
                path: dst,
                reason: "cannot move a directory into itself".into(),
            });
        }
        if let Some(p) = dst_disk.parent() {
            tokio::fs::create_dir_all(p).await?;
        }
        tokio::fs::rename(&src_disk, &dst_disk).await?;
        tracing::debug!(from = %src, to = %dst, "entry moved");
        Ok((src, dst))
    }

    /// Renames an entry inside its current directory.
    pub async fn rename_entry(&self, path: &str, new_name: &str) -> StorageResult<(String, String)> {
        if new_name.is_empty() || new_name.contains('/') || new_name.contains('\\') || new_name == ".." {
            return Err(StorageError::InvalidPath {
                path: new_name.to_string(),
                reason: "a new name must be a single path segment".into(),
            });
        }
        let (src, _) = self.resolve_entry(path)?;
        let target = join(parent(&src), new_name);
        self.move_entry(&src, &target).await
    }

    /// Reads a whole file.
    pub async fn read_file(&self, path: &str) -> StorageResult<Vec<u8>> {
        let (logical, disk) = self.resolve_entry(path)?;
        tokio::fs::read(&disk)
            .await
            .map_err(|e| StorageError::from_io(e, &logical))
    }

    /// Writes a whole file through a temporary sibling and a rename.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> StorageResult<String> {
        let (logical, disk) = self.resolve_entry(path)?;
        if let Some(p) = disk.parent() {
            tokio::fs::create_dir_all(p).await?;
        }
        let tmp = disk.with_file_name(format!(".{}.tmp-{}", file_name(&logical), uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &disk).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(logical)
    }

    /// True when `path` names a regular file.
    pub async fn is_file(&self, path: &str) -> bool {
        match self.resolve_entry(path) {
            Ok((_, disk)) => tokio::fs::metadata(&disk)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn root() -> (TempDir, StorageRoot) {
        let dir = TempDir::new().unwrap();
        let root = StorageRoot::open(dir.path()).await.unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn test_list_orders_dirs_first_and_hides_reserved() {
        let (_d, root) = root().await;
        root.create_dir("zeta").await.unwrap();
        root.write_file("alpha.txt", b"aa").await.unwrap();
        root.write_file("beta/inner.txt", b"b").await.unwrap();
        tokio::fs::create_dir_all(root.versions_dir()).await.unwrap();

        let entries = root.list_dir("/").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "zeta", "alpha.txt"]);
        assert_eq!(entries[2].size, 2);
        assert_eq!(entries[0].path, "beta");

        let inner = root.list_dir("beta").await.unwrap();
        assert_eq!(inner[0].path, "beta/inner.txt");
    }

    #[tokio::test]
    async fn test_list_missing_dir_not_found() {
        let (_d, root) = root().await;
        assert!(root.list_dir("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_over_file_fails() {
        let (_d, root) = root().await;
        root.write_file("x", b"1").await.unwrap();
        assert!(matches!(
            root.create_dir("x").await,
            Err(StorageError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_dir_and_file() {
        let (_d, root) = root().await;
        root.write_file("d/f.txt", b"1").await.unwrap();
        assert!(root.delete_dir("d/f.txt").await.is_err());
        root.delete_file("d/f.txt").await.unwrap();
        root.delete_dir("d").await.unwrap();
        assert!(root.delete_dir("d").await.unwrap_err().is_not_found());
        assert!(root.delete_file("d/f.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_move_and_rename() {
        let (_d, root) = root().await;
        root.write_file("a.txt", b"hello").await.unwrap();
        let (from, to) = root.move_entry("a.txt", "sub/b.txt").await.unwrap();
        assert_eq!((from.as_str(), to.as_str()), ("a.txt", "sub/b.txt"));
        assert!(!root.is_file("a.txt").await);

        let (_, renamed) = root.rename_entry("sub/b.txt", "c.txt").await.unwrap();
        assert_eq!(renamed, "sub/c.txt");
        assert_eq!(root.read_file("sub/c.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_move_refuses_existing_destination_and_self_nesting() {
        let (_d, root) = root().await;
        root.write_file("a.txt", b"1").await.unwrap();
        root.write_file("b.txt", b"2").await.unwrap();
        assert!(matches!(
            root.move_entry("a.txt", "b.txt").await,
            Err(StorageError::AlreadyExists { .. })
        ));
        root.create_dir("dir").await.unwrap();
        assert!(root.move_entry("dir", "dir/inner").await.is_err());
        assert!(root.move_entry("ghost", "g2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rename_rejects_paths() {
        let (_d, root) = root().await;
        root.write_file("a.txt", b"1").await.unwrap();
        assert!(root.rename_entry("a.txt", "x/y").await.is_err());
        assert!(root.rename_entry("a.txt", "").await.is_err());
    }
}

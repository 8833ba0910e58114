//! Logical path handling and the storage root.
//!
//! Clients send paths in whatever shape their platform produces. Everything is
//! normalized to a `/`-separated relative path before it touches the disk.

use std::path::{Path, PathBuf};

use crate::error::{StorageError, StorageResult};

/// Directory under the root holding version snapshots and the catalog.
pub const VERSIONS_DIR: &str = ".versions";

/// Directory under the root holding partially received uploads.
pub const STAGING_DIR: &str = ".staging";

/// Names that clients may not address directly.
pub const RESERVED_NAMES: &[&str] = &[VERSIONS_DIR, STAGING_DIR];

/// Normalizes a client-supplied path.
///
/// Strips surrounding quotes, converts backslashes, drops a drive letter and
/// leading slashes, and removes empty or `.` segments. `..` is rejected.
/// The empty string denotes the root.
pub fn normalize_path(raw: &str) -> StorageResult<String> {
    let mut s = raw.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s = &s[1..s.len() - 1];
    }
    let s = s.replace('\\', "/");
    let bytes = s.as_bytes();
    let s = if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        &s[2..]
    } else {
        &s[..]
    };

    let mut parts = Vec::new();
    for seg in s.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                return Err(StorageError::InvalidPath {
                    path: raw.to_string(),
                    reason: "parent directory segments are not allowed".into(),
                })
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// File name component of a normalized path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a normalized path, `""` for top-level entries.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

/// A directory on the local disk that logical paths resolve into.
#[derive(Debug, Clone)]
pub struct StorageRoot {
    root: PathBuf,
}

impl StorageRoot {
    /// Creates the root directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "storage root ready");
        Ok(Self { root })
    }

    /// Wraps an existing directory without touching the disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolves a client path to a location inside the root.
    ///
    /// Returns the normalized logical path together with the disk path.
    /// Reserved top-level names are rejected.
    pub fn resolve(&self, raw: &str) -> StorageResult<(String, PathBuf)> {
        let logical = normalize_path(raw)?;
        let first = logical.split('/').next().unwrap_or("");
        if RESERVED_NAMES.contains(&first) {
            return Err(StorageError::InvalidPath {
                path: raw.to_string(),
                reason: format!("{} is reserved", first),
            });
        }
        let disk = self.disk_path(&logical);
        Ok((logical, disk))
    }

    /// Resolves a path that must name something below the root.
    pub fn resolve_entry(&self, raw: &str) -> StorageResult<(String, PathBuf)> {
        let (logical, disk) = self.resolve(raw)?;
        if logical.is_empty() {
            return Err(StorageError::InvalidPath {
                path: raw.to_string(),
                reason: "the storage root cannot be used here".into(),
            });
        }
        Ok((logical, disk))
    }

    /// Disk location of an already normalized logical path.
    pub fn disk_path(&self, logical: &str) -> PathBuf {
        let mut p = self.root.clone();
        for seg in logical.split('/').filter(|s| !s.is_empty()) {
            p.push(seg);
        }
        p
    }

    /// Directory holding partial uploads.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Directory holding version snapshots.
    pub fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_variants() {
        assert_eq!(normalize_path("a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_path("/a//b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_path("\"docs\\report.pdf\"").unwrap(), "docs/report.pdf");
        assert_eq!(normalize_path("C:\\Users\\me\\x").unwrap(), "Users/me/x");
        assert_eq!(normalize_path("./a/./b").unwrap(), "a/b");
        assert_eq!(normalize_path("  /  ").unwrap(), "");
    }

    #[test]
    fn test_normalize_rejects_parent_segments() {
        assert!(matches!(
            normalize_path("a/../../etc/passwd"),
            Err(StorageError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_name_and_parent() {
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(parent("a/b/c.txt"), "a/b");
        assert_eq!(file_name("c.txt"), "c.txt");
        assert_eq!(parent("c.txt"), "");
    }

    #[test]
    fn test_resolve_rejects_reserved() {
        let root = StorageRoot::new("/srv/data");
        assert!(root.resolve(".versions/versions.json").is_err());
        assert!(root.resolve("/.staging/x").is_err());
        let (logical, disk) = root.resolve("docs/a.txt").unwrap();
        assert_eq!(logical, "docs/a.txt");
        assert_eq!(disk, PathBuf::from("/srv/data/docs/a.txt"));
    }

    #[test]
    fn test_resolve_entry_rejects_root() {
        let root = StorageRoot::new("/srv/data");
        assert!(root.resolve_entry("/").is_err());
        assert!(root.resolve("/").is_ok());
    }

    proptest! {
        #[test]
        fn prop_normalized_paths_stay_relative(raw in "[a-zA-Z0-9./\\\\:\"' ]{0,40}") {
            if let Ok(p) = normalize_path(&raw) {
                prop_assert!(!p.starts_with('/'));
                prop_assert!(!p.contains('\\'));
                prop_assert!(!p.contains("//"));
                prop_assert!(p.split('/').all(|seg| seg != ".." && seg != "."));
            }
        }
    }
}

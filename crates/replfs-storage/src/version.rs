//! Bounded per-file version history.
//!
//! A version is an immutable copy of a file's bytes stored under
//! `.versions/<path>.<version_id>`. Records for every path live in a JSON
//! catalog, `.versions/versions.json`, rewritten atomically after each change.
//! Histories are kept newest first and pruned to `max_versions`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use replfs_transport::sha256_hex;

use crate::error::{StorageError, StorageResult};
use crate::paths::{file_name, StorageRoot};

/// Default number of versions retained per path.
pub const MAX_VERSIONS: usize = 10;

/// Catalog file name inside the versions directory.
pub const CATALOG_FILE: &str = "versions.json";

/// Creator recorded on backups taken before a restore.
pub const RESTORE_BACKUP_CREATOR: &str = "system";

/// Comment recorded on backups taken before a restore.
pub const RESTORE_BACKUP_COMMENT: &str = "Automatic backup before version restore";

/// One retained snapshot of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Unique id (UUID v4)
    pub version_id: String,
    /// File name at snapshot time
    pub file_name: String,
    /// Logical path
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Hex SHA-256 of the snapshot
    pub checksum: String,
    /// Snapshot time
    pub created_at: DateTime<Utc>,
    /// Store-wide creation counter; orders versions with equal timestamps
    pub sequence: u64,
    /// Who asked for the snapshot
    pub creator: String,
    /// Free-form note
    pub comment: String,
}

/// Result of a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// The version whose bytes are now live
    pub restored: Version,
    /// Snapshot of the live file taken before it was overwritten
    pub backup: Option<Version>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    next_sequence: u64,
    versions: HashMap<String, Vec<Version>>,
}

/// Version history for every file under one storage root.
pub struct VersionStore {
    root: StorageRoot,
    max_versions: usize,
    history: DashMap<String, Vec<Version>>,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
    catalog_lock: Mutex<()>,
    sequence: AtomicU64,
}

impl VersionStore {
    /// Opens the store and loads the catalog.
    ///
    /// A missing catalog starts an empty history; an unreadable one is logged
    /// and also starts empty.
    pub async fn open(root: StorageRoot, max_versions: usize) -> StorageResult<Self> {
        tokio::fs::create_dir_all(root.versions_dir()).await?;
        let catalog_path = root.versions_dir().join(CATALOG_FILE);
        let catalog = match tokio::fs::read(&catalog_path).await {
            Ok(bytes) => match serde_json::from_slice::<Catalog>(&bytes) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %catalog_path.display(), error = %e, "version catalog unreadable, starting empty");
                    Catalog::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Catalog::default(),
            Err(e) => {
                tracing::warn!(path = %catalog_path.display(), error = %e, "version catalog unreadable, starting empty");
                Catalog::default()
            }
        };
        let max_seq = catalog
            .versions
            .values()
            .flatten()
            .map(|v| v.sequence + 1)
            .max()
            .unwrap_or(0);
        let history = DashMap::new();
        let mut count = 0;
        for (path, mut versions) in catalog.versions {
            sort_newest_first(&mut versions);
            count += versions.len();
            history.insert(path, versions);
        }
        tracing::info!(paths = history.len(), versions = count, "version catalog loaded");
        Ok(Self {
            root,
            max_versions: max_versions.max(1),
            history,
            path_locks: DashMap::new(),
            catalog_lock: Mutex::new(()),
            sequence: AtomicU64::new(catalog.next_sequence.max(max_seq)),
        })
    }

    /// Retention limit per path.
    pub fn max_versions(&self) -> usize {
        self.max_versions
    }

    /// Snapshots the live file at `path`.
    pub async fn create_version(
        &self,
        path: &str,
        creator: &str,
        comment: &str,
    ) -> StorageResult<Version> {
        let (logical, _) = self.root.resolve_entry(path)?;
        let lock = self.lock_for(&logical);
        let _guard = lock.lock().await;
        let version = self.snapshot_locked(&logical, creator, comment).await?;
        self.persist().await?;
        Ok(version)
    }

    /// Versions of `path`, newest first. Empty when there are none.
    pub fn list_versions(&self, path: &str) -> Vec<Version> {
        let Ok(logical) = crate::paths::normalize_path(path) else {
            return Vec::new();
        };
        self.history
            .get(&logical)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    /// Makes `version_id` the live content of `path`.
    ///
    /// The current live file, when present, is snapshotted first with
    /// creator `system`. The restored version's bytes are read before that
    /// snapshot so pruning cannot remove them.
    pub async fn restore_version(&self, path: &str, version_id: &str) -> StorageResult<RestoreOutcome> {
        let (logical, live) = self.root.resolve_entry(path)?;
        let lock = self.lock_for(&logical);
        let _guard = lock.lock().await;

        let restored = self
            .find(&logical, version_id)
            .ok_or_else(|| StorageError::VersionNotFound {
                path: logical.clone(),
                version_id: version_id.to_string(),
            })?;
        let bytes = tokio::fs::read(self.version_path(&logical, version_id))
            .await
            .map_err(|e| StorageError::from_io(e, &logical))?;

        let backup = if tokio::fs::metadata(&live).await.map(|m| m.is_file()).unwrap_or(false) {
            Some(
                self.snapshot_locked(&logical, RESTORE_BACKUP_CREATOR, RESTORE_BACKUP_COMMENT)
                    .await?,
            )
        } else {
            None
        };

        self.root.write_file(&logical, &bytes).await?;
        self.persist().await?;
        tracing::info!(path = %logical, version_id, "version restored");
        Ok(RestoreOutcome { restored, backup })
    }

    /// Deletes one retained version and its bytes.
    pub async fn delete_version(&self, path: &str, version_id: &str) -> StorageResult<Version> {
        let (logical, _) = self.root.resolve_entry(path)?;
        let lock = self.lock_for(&logical);
        let _guard = lock.lock().await;

        let removed = {
            let mut entry = self.history.entry(logical.clone()).or_default();
            let pos = entry.iter().position(|v| v.version_id == version_id);
            pos.map(|i| entry.remove(i))
        };
        let removed = removed.ok_or_else(|| StorageError::VersionNotFound {
            path: logical.clone(),
            version_id: version_id.to_string(),
        })?;
        self.history.remove_if(&logical, |_, v| v.is_empty());
        self.remove_bytes(&removed).await;
        self.persist().await?;
        Ok(removed)
    }

    async fn snapshot_locked(&self, logical: &str, creator: &str, comment: &str) -> StorageResult<Version> {
        let bytes = self.root.read_file(logical).await?;
        let version_id = uuid::Uuid::new_v4().to_string();
        let target = self.version_path(logical, &version_id);
        if let Some(p) = target.parent() {
            tokio::fs::create_dir_all(p).await?;
        }
        tokio::fs::write(&target, &bytes).await?;

        let version = Version {
            version_id,
            file_name: file_name(logical).to_string(),
            path: logical.to_string(),
            size: bytes.len() as u64,
            checksum: sha256_hex(&bytes),
            created_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            creator: creator.to_string(),
            comment: comment.to_string(),
        };

        let pruned = {
            let mut entry = self.history.entry(logical.to_string()).or_default();
            entry.push(version.clone());
            sort_newest_first(&mut entry);
            if entry.len() > self.max_versions {
                entry.split_off(self.max_versions)
            } else {
                Vec::new()
            }
        };
        for old in &pruned {
            tracing::debug!(path = logical, version_id = %old.version_id, "pruning version");
            self.remove_bytes(old).await;
        }
        tracing::info!(path = logical, version_id = %version.version_id, size = version.size, "version created");
        Ok(version)
    }

    fn find(&self, logical: &str, version_id: &str) -> Option<Version> {
        self.history
            .get(logical)
            .and_then(|v| v.iter().find(|v| v.version_id == version_id).cloned())
    }

    fn lock_for(&self, logical: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(logical.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn version_path(&self, logical: &str, version_id: &str) -> PathBuf {
        let mut p = self.root.versions_dir();
        let mut segs: Vec<&str> = logical.split('/').collect();
        let last = segs.pop().unwrap_or_default();
        for s in segs {
            p.push(s);
        }
        p.push(format!("{}.{}", last, version_id));
        p
    }

    async fn remove_bytes(&self, version: &Version) {
        let p = self.version_path(&version.path, &version.version_id);
        if let Err(e) = tokio::fs::remove_file(&p).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %p.display(), error = %e, "failed to delete version bytes");
            }
        }
    }

    async fn persist(&self) -> StorageResult<()> {
        let _guard = self.catalog_lock.lock().await;
        let catalog = Catalog {
            next_sequence: self.sequence.load(Ordering::SeqCst),
            versions: self
                .history
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&catalog).map_err(|e| StorageError::Catalog(e.to_string()))?;
        let dir = self.root.versions_dir();
        let tmp = dir.join(format!("{}.tmp", CATALOG_FILE));
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, dir.join(CATALOG_FILE)).await?;
        Ok(())
    }
}

fn sort_newest_first(versions: &mut [Version]) {
    versions.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.sequence.cmp(&a.sequence))
    });
}

//! Durable store access outside the sandbox, and backup records.
//!
//! Backups are written through the mount inside each sandbox. The host
//! only needs two things from the store itself: listing and deleting keys
//! under a project prefix, for hard deletion. Which projects have a backup
//! is tracked separately in [`ProjectMetadata`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Raw key-space access to the durable store.
#[async_trait]
pub(crate) trait DurableStore: Send + Sync {
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deletes `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Key prefix holding everything backed up for a project.
pub(crate) fn project_prefix(user_id: &str, project_id: &str) -> String {
    format!("{user_id}/{project_id}/")
}

/// Deletes every key under the project's prefix. Returns how many.
pub(crate) async fn purge_project(
    store: &dyn DurableStore,
    user_id: &str,
    project_id: &str,
) -> Result<usize> {
    let prefix = project_prefix(user_id, project_id);
    let keys = store.list(&prefix).await?;
    for key in &keys {
        store.delete(key).await?;
    }
    info!(user = user_id, project = project_id, "Purged {} keys from durable store", keys.len());
    Ok(keys.len())
}

/// A store whose key space is a host directory.
///
/// Keys are `/`-separated paths relative to `root`. This is the same
/// layout the sandboxes see through their mount.
#[derive(Debug, Clone)]
pub(crate) struct LocalDurableStore {
    root: PathBuf,
}

impl LocalDurableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DurableStore for LocalDurableStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            collect_keys(&root, &root, &mut keys)?;
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
        .await
        .context("Store listing task failed")?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.root.join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete {}", path.display()))
            }
        }

        // Drop directories the delete left empty, up to the root
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }
}

fn collect_keys(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }
    Ok(())
}

/// Where and when a project was last backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub user_id: String,
    pub project_id: String,
    /// Backup location inside the durable store
    pub path: String,
    pub last_backup_at: DateTime<Utc>,
}

/// Per-project backup bookkeeping.
#[async_trait]
pub(crate) trait ProjectMetadata: Send + Sync {
    async fn record(&self, user_id: &str, project_id: &str) -> Result<Option<BackupRecord>>;

    async fn has_backup(&self, user_id: &str, project_id: &str) -> Result<bool> {
        Ok(self.record(user_id, project_id).await?.is_some())
    }

    async fn mark_backed_up(
        &self,
        user_id: &str,
        project_id: &str,
        path: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Removes the record. Returns whether there was one.
    async fn forget(&self, user_id: &str, project_id: &str) -> Result<bool>;

    /// All records, ordered by user then project.
    async fn records(&self) -> Result<Vec<BackupRecord>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    projects: Vec<BackupRecord>,
}

/// Backup records kept in a TOML file on the host.
#[derive(Debug)]
pub(crate) struct FileMetadataStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    guard: Mutex<()>,
}

impl FileMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<MetadataFile> {
        if !self.path.exists() {
            return Ok(MetadataFile::default());
        }

        let content = fs::read_to_string(&self.path).with_context(|| {
            format!("Failed to read metadata file: {}", self.path.display())
        })?;

        toml::from_str(&content).with_context(|| {
            format!("Failed to parse metadata file: {}", self.path.display())
        })
    }

    fn save(&self, file: &MetadataFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(file).context("Failed to serialize metadata")?;

        fs::write(&self.path, content).with_context(|| {
            format!("Failed to write metadata file: {}", self.path.display())
        })
    }
}

#[async_trait]
impl ProjectMetadata for FileMetadataStore {
    async fn record(&self, user_id: &str, project_id: &str) -> Result<Option<BackupRecord>> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .load()?
            .projects
            .into_iter()
            .find(|r| r.user_id == user_id && r.project_id == project_id))
    }

    async fn mark_backed_up(
        &self,
        user_id: &str,
        project_id: &str,
        path: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        let record = BackupRecord {
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            path: path.to_string(),
            last_backup_at: at,
        };
        match file
            .projects
            .iter_mut()
            .find(|r| r.user_id == user_id && r.project_id == project_id)
        {
            Some(existing) => *existing = record,
            None => file.projects.push(record),
        }
        file.projects
            .sort_by(|a, b| (&a.user_id, &a.project_id).cmp(&(&b.user_id, &b.project_id)));
        self.save(&file)?;
        debug!(user = user_id, project = project_id, "Recorded backup");
        Ok(())
    }

    async fn forget(&self, user_id: &str, project_id: &str) -> Result<bool> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        let before = file.projects.len();
        file.projects
            .retain(|r| !(r.user_id == user_id && r.project_id == project_id));
        if file.projects.len() == before {
            return Ok(false);
        }
        self.save(&file)?;
        Ok(true)
    }

    async fn records(&self) -> Result<Vec<BackupRecord>> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.projects)
    }
}

/// In-memory records for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryMetadataStore {
    records: Mutex<std::collections::BTreeMap<(String, String), BackupRecord>>,
}

#[cfg(test)]
#[async_trait]
impl ProjectMetadata for MemoryMetadataStore {
    async fn record(&self, user_id: &str, project_id: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), project_id.to_string()))
            .cloned())
    }

    async fn mark_backed_up(
        &self,
        user_id: &str,
        project_id: &str,
        path: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.records.lock().unwrap().insert(
            (user_id.to_string(), project_id.to_string()),
            BackupRecord {
                user_id: user_id.to_string(),
                project_id: project_id.to_string(),
                path: path.to_string(),
                last_backup_at: at,
            },
        );
        Ok(())
    }

    async fn forget(&self, user_id: &str, project_id: &str) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .remove(&(user_id.to_string(), project_id.to_string()))
            .is_some())
    }

    async fn records(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }
}

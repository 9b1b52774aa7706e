//! Delete a project's backup from the host view of the store.
//!
//! Only safe while no coordinator has a live sandbox for the project; the
//! `purge` request of `sandvault serve` enforces that, this command cannot.

use anyhow::{bail, Result};
use colored::Colorize;
use tracing::info;

use crate::config::{expand_path, Config};
use crate::store::{purge_project, FileMetadataStore, LocalDurableStore, ProjectMetadata};

pub(crate) async fn run(config: &Config, user_id: &str, project_id: &str) -> Result<()> {
    let store = LocalDurableStore::new(expand_path(&config.store.local_root)?);
    let metadata = FileMetadataStore::new(expand_path(&config.metadata.path)?);
    let (removed, had_record) = purge(&store, &metadata, user_id, project_id).await?;

    info!(user = user_id, project = project_id, removed, "Purged project");
    if removed == 0 && !had_record {
        println!(
            "{} Nothing stored for {}/{}",
            "ℹ".blue(),
            user_id,
            project_id.cyan()
        );
    } else {
        println!(
            "{} Removed {} files for {}/{}",
            "✓".green().bold(),
            removed,
            user_id,
            project_id.cyan()
        );
    }
    Ok(())
}

async fn purge(
    store: &LocalDurableStore,
    metadata: &dyn ProjectMetadata,
    user_id: &str,
    project_id: &str,
) -> Result<(usize, bool)> {
    for id in [user_id, project_id] {
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            bail!("Invalid id: '{id}'");
        }
    }
    let removed = purge_project(store, user_id, project_id).await?;
    let had_record = metadata.forget(user_id, project_id).await?;
    Ok((removed, had_record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_purge_removes_files_and_record() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("store");
        fs::create_dir_all(root.join("alice/p1/src")).unwrap();
        fs::write(root.join("alice/p1/src/a.ts"), "a").unwrap();
        fs::create_dir_all(root.join("alice/p2")).unwrap();
        fs::write(root.join("alice/p2/b.ts"), "b").unwrap();

        let store = LocalDurableStore::new(&root);
        let metadata = FileMetadataStore::new(dir.path().join("projects.toml"));
        metadata
            .mark_backed_up("alice", "p1", "/mnt/sandvault/alice/p1", Utc::now())
            .await
            .unwrap();

        let (removed, had_record) = purge(&store, &metadata, "alice", "p1").await.unwrap();
        assert_eq!(removed, 1);
        assert!(had_record);
        assert!(!root.join("alice/p1").exists());
        assert!(root.join("alice/p2/b.ts").exists());
        assert!(!metadata.has_backup("alice", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_rejects_traversal() {
        let dir = tempdir().unwrap();
        let store = LocalDurableStore::new(dir.path());
        let metadata = FileMetadataStore::new(dir.path().join("projects.toml"));
        assert!(purge(&store, &metadata, "..", "p1").await.is_err());
        assert!(purge(&store, &metadata, "alice", "a/b").await.is_err());
    }
}

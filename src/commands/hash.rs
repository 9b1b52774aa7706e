use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::hash::ChangeHashTracker;
use crate::runner::CommandRunner;
use crate::sandbox::LocalSandbox;

/// Prints the change fingerprint of a host directory, using the same
/// exclusions as auto-backup.
pub(crate) async fn run(config: &Config, dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let dir = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;

    let tracker = ChangeHashTracker::new(
        CommandRunner::default(),
        "/",
        config.backup.exclude_dirs.clone(),
        config.backup.exclude_files.clone(),
    );
    match tracker.hash(&LocalSandbox::attach(&dir)).await? {
        Some(hash) => println!("{hash}"),
        None => bail!("Could not list files in {}", dir.display()),
    }
    Ok(())
}

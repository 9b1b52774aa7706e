//! Content fingerprints of a sandbox's project directory.
//!
//! The fingerprint covers relative paths and sizes only. Modification
//! times are left out: a restore rewrites every timestamp without
//! changing content, and would otherwise make every restored project
//! look dirty.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::runner::CommandRunner;
use crate::sandbox::{CommandOptions, Sandbox, SandboxError};

/// Computes change fingerprints for a project directory.
#[derive(Debug, Clone)]
pub(crate) struct ChangeHashTracker {
    runner: CommandRunner,
    project_dir: String,
    exclude_dirs: Vec<String>,
    exclude_files: Vec<String>,
}

impl ChangeHashTracker {
    pub fn new(
        runner: CommandRunner,
        project_dir: impl Into<String>,
        exclude_dirs: Vec<String>,
        exclude_files: Vec<String>,
    ) -> Self {
        Self {
            runner,
            project_dir: project_dir.into(),
            exclude_dirs,
            exclude_files,
        }
    }

    /// Fingerprints the project in `sandbox`.
    ///
    /// `Ok(None)` means the listing tool failed and the caller should not
    /// trust any comparison. `Err` is reserved for an unreachable sandbox,
    /// whose session should be reaped rather than retried.
    pub async fn hash(&self, sandbox: &dyn Sandbox) -> Result<Option<String>, SandboxError> {
        let command = listing_command(&self.exclude_dirs, &self.exclude_files);
        let options = CommandOptions::in_dir(sandbox.resolve(&self.project_dir));

        match self.runner.run(sandbox, &command, &options).await {
            Ok(output) if output.success() => {
                let hash = fingerprint(&output.stdout);
                debug!(sandbox = sandbox.id(), hash = %hash, "Computed project fingerprint");
                Ok(Some(hash))
            }
            Ok(output) => {
                warn!(
                    sandbox = sandbox.id(),
                    exit_code = output.exit_code,
                    "Listing project files failed: {}",
                    output.stderr.trim()
                );
                Ok(None)
            }
            Err(e) if e.is_unreachable() => Err(e),
            Err(e) => {
                warn!(sandbox = sandbox.id(), "Hashing project failed: {}", e);
                Ok(None)
            }
        }
    }
}

/// Builds a `find` invocation printing `relative_path<TAB>size` per file,
/// pruning excluded directories and skipping excluded file names.
pub(crate) fn listing_command(exclude_dirs: &[String], exclude_files: &[String]) -> String {
    let mut command = String::from("find .");

    if !exclude_dirs.is_empty() {
        let names = exclude_dirs
            .iter()
            .map(|d| format!("-name {}", shell_words::quote(d)))
            .collect::<Vec<_>>()
            .join(" -o ");
        command.push_str(&format!(" -type d \\( {names} \\) -prune -o"));
    }

    command.push_str(" -type f");
    for file in exclude_files {
        command.push_str(&format!(" ! -name {}", shell_words::quote(file)));
    }
    command.push_str(" -printf '%P\\t%s\\n'");
    command
}

/// Hashes a `path<TAB>size` listing, independent of line order.
pub(crate) fn fingerprint(listing: &str) -> String {
    let mut entries: Vec<(&str, u64)> = listing
        .lines()
        .filter_map(|line| {
            let (path, size) = line.rsplit_once('\t')?;
            Some((path, size.trim().parse().ok()?))
        })
        .collect();
    entries.sort_unstable();

    let mut hasher = Sha256::new();
    for (path, size) in entries {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(size.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::{MockReply, MockSandbox};
    use crate::sandbox::LocalSandbox;
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn tracker() -> ChangeHashTracker {
        ChangeHashTracker::new(
            CommandRunner::default(),
            "/project",
            vec!["node_modules".to_string(), ".next".to_string()],
            vec!["package-lock.json".to_string()],
        )
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join("project").join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
    }

    fn backdate(root: &Path, rel: &str) {
        let file = fs::File::options()
            .write(true)
            .open(root.join("project").join(rel))
            .unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))
            .unwrap();
    }

    #[test]
    fn test_fingerprint_ignores_line_order() {
        let a = fingerprint("src/a.ts\t10\nsrc/b.ts\t20\n");
        let b = fingerprint("src/b.ts\t20\nsrc/a.ts\t10\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_sees_size_and_path_changes() {
        let base = fingerprint("a.ts\t10\n");
        assert_ne!(base, fingerprint("a.ts\t11\n"));
        assert_ne!(base, fingerprint("b.ts\t10\n"));
        assert_ne!(base, fingerprint("a.ts\t10\nb.ts\t0\n"));
    }

    #[test]
    fn test_fingerprint_skips_malformed_lines() {
        assert_eq!(
            fingerprint("a.ts\t10\ngarbage\nb.ts\tnope\n"),
            fingerprint("a.ts\t10\n")
        );
    }

    #[test]
    fn test_listing_command_prunes_and_skips() {
        let cmd = listing_command(
            &["node_modules".to_string(), ".next".to_string()],
            &["yarn.lock".to_string()],
        );
        assert!(cmd.starts_with("find ."));
        assert!(cmd.contains("-name node_modules -o -name .next"));
        assert!(cmd.contains("-prune"));
        assert!(cmd.contains("! -name yarn.lock"));
        assert!(cmd.ends_with("-printf '%P\\t%s\\n'"));
    }

    #[tokio::test]
    async fn test_hash_stable_across_restore_with_new_mtimes() {
        let original = tempdir().unwrap();
        write(original.path(), "package.json", "{\"name\":\"app\"}");
        write(original.path(), "src/index.ts", "console.log('hi')");
        write(original.path(), "node_modules/left-pad/index.js", "module.exports = 1");

        // The restored copy has fresh content timestamps and no dependency cache
        let restored = tempdir().unwrap();
        write(restored.path(), "src/index.ts", "console.log('hi')");
        write(restored.path(), "package.json", "{\"name\":\"app\"}");
        write(restored.path(), "package-lock.json", "{}");
        backdate(restored.path(), "src/index.ts");
        backdate(restored.path(), "package.json");

        let tracker = tracker();
        let before = tracker
            .hash(&LocalSandbox::attach(original.path()))
            .await
            .unwrap()
            .unwrap();
        let after = tracker
            .hash(&LocalSandbox::attach(restored.path()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_hash_changes_when_content_grows() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/index.ts", "a");
        let sandbox = LocalSandbox::attach(dir.path());
        let tracker = tracker();

        let before = tracker.hash(&sandbox).await.unwrap();
        write(dir.path(), "src/index.ts", "ab");
        let after = tracker.hash(&sandbox).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_tool_failure_is_none() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.on("find", MockReply::code(1));
        assert_eq!(tracker().hash(&sandbox).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_sandbox_is_an_error() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.on("find", MockReply::Unreachable);
        let err = tracker().hash(&sandbox).await.unwrap_err();
        assert!(err.is_unreachable());
    }
}

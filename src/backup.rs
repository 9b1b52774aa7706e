//! One-way directory sync between a sandbox's project and the mounted store.
//!
//! The mount is a network filesystem and rsync against it fails in
//! creative ways, many of which still leave a usable copy behind. A failed
//! run is therefore followed by a check of the destination before it is
//! declared a failure. Nothing here returns an error: callers get a
//! [`SyncOutcome`] and carry on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::runner::CommandRunner;
use crate::sandbox::{CommandOptions, Sandbox, SandboxError};
use crate::store::ProjectMetadata;

/// rsync: some files could not be transferred.
const RSYNC_PARTIAL_TRANSFER: i64 = 23;
/// rsync: source files vanished mid-transfer.
const RSYNC_VANISHED_SOURCE: i64 = 24;

/// How a successful sync went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SyncStatus {
    /// Clean exit.
    Complete,
    /// Some files were skipped or vanished mid-run.
    Partial,
    /// The sync failed but the destination exists and is readable.
    Verified,
}

/// Whether a backup may delete files from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackupMode {
    /// The store becomes an exact copy of the project.
    Mirror,
    /// Copy only. Used while the project holds less than the store.
    Additive,
}

/// Result of a best-effort backup or restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub(crate) enum SyncOutcome {
    Synced { at: DateTime<Utc>, status: SyncStatus },
    /// Nothing to do, e.g. restoring a project that was never backed up.
    Skipped { reason: String },
    Failed { reason: String },
    /// The sandbox is gone; its session should be reaped.
    Unreachable,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Synced { .. })
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    fn from_error(err: &SandboxError) -> Self {
        if err.is_unreachable() {
            Self::Unreachable
        } else {
            Self::failed(err.to_string())
        }
    }
}

/// Maps an rsync exit code to a sync status, `None` for real failures.
pub(crate) fn classify_exit(exit_code: i64) -> Option<SyncStatus> {
    match exit_code {
        0 => Some(SyncStatus::Complete),
        RSYNC_PARTIAL_TRANSFER | RSYNC_VANISHED_SOURCE => Some(SyncStatus::Partial),
        _ => None,
    }
}

/// Builds an `rsync -a` invocation copying the contents of `src` into `dst`.
pub(crate) fn sync_command(src: &str, dst: &str, delete: bool, excludes: &[String]) -> String {
    let mut args = vec!["rsync".to_string(), "-a".to_string()];
    if delete {
        args.push("--delete".to_string());
    }
    for pattern in excludes {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }
    args.push(format!("{}/", src.trim_end_matches('/')));
    args.push(format!("{}/", dst.trim_end_matches('/')));
    shell_words::join(args)
}

/// Backs projects up to, and restores them from, the mounted store.
#[derive(Clone)]
pub(crate) struct BackupEngine {
    runner: CommandRunner,
    project_dir: String,
    mount_point: String,
    excludes: Vec<String>,
    metadata: Arc<dyn ProjectMetadata>,
}

impl BackupEngine {
    pub fn new(
        runner: CommandRunner,
        project_dir: impl Into<String>,
        mount_point: impl Into<String>,
        excludes: Vec<String>,
        metadata: Arc<dyn ProjectMetadata>,
    ) -> Self {
        Self {
            runner,
            project_dir: project_dir.into(),
            mount_point: mount_point.into(),
            excludes,
            metadata,
        }
    }

    /// Backup location as a sandbox path.
    pub fn destination(&self, user_id: &str, project_id: &str) -> String {
        format!(
            "{}/{user_id}/{project_id}",
            self.mount_point.trim_end_matches('/')
        )
    }

    /// Copies the project into the store. The caller must have checked
    /// the mount.
    pub async fn backup(
        &self,
        sandbox: &dyn Sandbox,
        user_id: &str,
        project_id: &str,
        mode: BackupMode,
    ) -> SyncOutcome {
        let record_path = self.destination(user_id, project_id);
        let dst = sandbox.resolve(&record_path);
        let src = sandbox.resolve(&self.project_dir);
        let options = CommandOptions::default();

        let mkdir = format!("mkdir -p {}", shell_words::quote(&dst));
        match self.runner.run_until_success(sandbox, &mkdir, &options).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                error!(
                    sandbox = sandbox.id(),
                    project = project_id,
                    "Cannot create backup directory: {}",
                    output.stderr.trim()
                );
                return SyncOutcome::failed(format!("mkdir exited with {}", output.exit_code));
            }
            Err(e) => {
                error!(sandbox = sandbox.id(), project = project_id, "Cannot create backup directory: {}", e);
                return SyncOutcome::from_error(&e);
            }
        }

        let rsync = sync_command(&src, &dst, mode == BackupMode::Mirror, &self.excludes);
        debug!(sandbox = sandbox.id(), ?mode, "Backing up: {}", rsync);
        let status = match self.runner.run(sandbox, &rsync, &options).await {
            Ok(output) => match classify_exit(output.exit_code) {
                Some(status) => {
                    if status == SyncStatus::Partial {
                        warn!(
                            sandbox = sandbox.id(),
                            project = project_id,
                            exit_code = output.exit_code,
                            "Backup completed with skipped files"
                        );
                    }
                    status
                }
                None => {
                    warn!(
                        sandbox = sandbox.id(),
                        project = project_id,
                        exit_code = output.exit_code,
                        "Backup sync failed, verifying destination: {}",
                        output.stderr.trim()
                    );
                    match self.verify(sandbox, &dst).await {
                        Ok(status) => status,
                        Err(outcome) => return outcome,
                    }
                }
            },
            Err(e) if e.is_unreachable() => {
                warn!(sandbox = sandbox.id(), project = project_id, "Sandbox gone during backup");
                return SyncOutcome::Unreachable;
            }
            Err(e) => {
                warn!(
                    sandbox = sandbox.id(),
                    project = project_id,
                    "Backup sync kept failing ({}), verifying destination",
                    e
                );
                match self.verify(sandbox, &dst).await {
                    Ok(status) => status,
                    Err(outcome) => return outcome,
                }
            }
        };

        let at = Utc::now();
        if let Err(e) = self
            .metadata
            .mark_backed_up(user_id, project_id, &record_path, at)
            .await
        {
            error!(project = project_id, "Backup succeeded but recording it failed: {:#}", e);
        }
        info!(
            sandbox = sandbox.id(),
            user = user_id,
            project = project_id,
            ?status,
            ?mode,
            "Project backed up"
        );
        SyncOutcome::Synced { at, status }
    }

    async fn verify(&self, sandbox: &dyn Sandbox, dst: &str) -> Result<SyncStatus, SyncOutcome> {
        let quoted = shell_words::quote(dst);
        let probe = format!("test -d {quoted} && ls {quoted} >/dev/null");
        match self
            .runner
            .check(sandbox, &probe, &CommandOptions::default())
            .await
        {
            Ok(true) => Ok(SyncStatus::Verified),
            Ok(false) => {
                error!(sandbox = sandbox.id(), "Backup destination {} is not readable", dst);
                Err(SyncOutcome::failed("backup destination missing after failed sync"))
            }
            Err(e) => {
                error!(sandbox = sandbox.id(), "Cannot verify backup destination: {}", e);
                Err(SyncOutcome::from_error(&e))
            }
        }
    }

    /// Copies a previous backup into the project dir.
    ///
    /// Additive only: files created in the sandbox before the restore are
    /// left alone.
    pub async fn restore(&self, sandbox: &dyn Sandbox, user_id: &str, project_id: &str) -> SyncOutcome {
        match self.metadata.has_backup(user_id, project_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(project = project_id, "No backup recorded, nothing to restore");
                return SyncOutcome::skipped("no backup recorded");
            }
            Err(e) => {
                error!(project = project_id, "Cannot read backup record: {:#}", e);
                return SyncOutcome::failed(format!("{e:#}"));
            }
        }

        let src = sandbox.resolve(&self.destination(user_id, project_id));
        let dst = sandbox.resolve(&self.project_dir);
        let options = CommandOptions::default();

        let exists = format!("test -d {}", shell_words::quote(&src));
        match self.runner.check(sandbox, &exists, &options).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(project = project_id, "Backup recorded but {} is missing", src);
                return SyncOutcome::skipped("backup directory missing");
            }
            Err(e) => return SyncOutcome::from_error(&e),
        }

        let mkdir = format!("mkdir -p {}", shell_words::quote(&dst));
        if let Err(e) = self.runner.run_until_success(sandbox, &mkdir, &options).await {
            return SyncOutcome::from_error(&e);
        }

        let rsync = sync_command(&src, &dst, false, &[]);
        match self.runner.run(sandbox, &rsync, &options).await {
            Ok(output) => match classify_exit(output.exit_code) {
                Some(status) => {
                    info!(sandbox = sandbox.id(), project = project_id, ?status, "Project restored");
                    SyncOutcome::Synced {
                        at: Utc::now(),
                        status,
                    }
                }
                None => {
                    error!(
                        sandbox = sandbox.id(),
                        project = project_id,
                        exit_code = output.exit_code,
                        "Restore failed: {}",
                        output.stderr.trim()
                    );
                    SyncOutcome::failed(format!("rsync exited with {}", output.exit_code))
                }
            },
            Err(e) => {
                error!(sandbox = sandbox.id(), project = project_id, "Restore failed: {}", e);
                SyncOutcome::from_error(&e)
            }
        }
    }
}

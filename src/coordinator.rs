//! Lifecycle coordinator: one live sandbox per project, backed up before
//! it dies.
//!
//! Everything the outside world can do to a sandbox goes through
//! [`Coordinator`]. It owns the session registry, the per-project creation
//! locks and the shutdown scheduler, and wires the mount, backup and hash
//! engines together.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupEngine, BackupMode, SyncOutcome};
use crate::config::{expand_path, Config, InstallConfig, StoreCredentials};
use crate::error::CoordinatorError;
use crate::hash::ChangeHashTracker;
use crate::health::HealthProbe;
use crate::mount::MountManager;
use crate::runner::{CommandRunner, RetryPolicy};
use crate::sandbox::{
    CommandOptions, CommandOutput, DockerProvider, LocalProvider, ProviderKind, Sandbox,
    SandboxError, SandboxProvider,
};
use crate::session::{ProjectLocks, SandboxSession, SessionRegistry};
use crate::shutdown::{
    PendingShutdown, ShutdownHooks, ShutdownPhase, ShutdownScheduler, ShutdownTimings,
};
use crate::store::{
    purge_project, DurableStore, FileMetadataStore, LocalDurableStore, ProjectMetadata,
};

/// What a project looks like from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// No live sandbox; the next load creates one.
    Ready,
    Active,
    BackingUp,
}

/// Result of [`Coordinator::load_or_create`].
#[derive(Debug, Clone, Serialize)]
pub struct LoadedSandbox {
    pub session: SandboxSession,
    pub url: String,
    /// False when an existing sandbox was reused.
    pub created: bool,
    /// Whether the dev server answered before the health timeout.
    pub ready: bool,
}

/// A file produced by generation, relative to the project root.
#[derive(Debug, Clone, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub contents: String,
}

/// Result of one auto-backup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AutoBackup {
    /// The session no longer exists.
    Gone,
    /// A shutdown is already handling the backup.
    ShuttingDown,
    Unchanged,
    BackedUp(SyncOutcome),
    /// The sandbox died; its session must be reaped.
    Unreachable,
}

struct Settings {
    template: String,
    port: u16,
    lease: Duration,
    project_dir: String,
    install: InstallConfig,
    backup_wait: Duration,
    backup_poll: Duration,
    auto_interval: Option<Duration>,
}

struct Inner {
    settings: Settings,
    provider: Arc<dyn SandboxProvider>,
    registry: SessionRegistry,
    /// Held across sandbox creation.
    creation_locks: ProjectLocks,
    /// Keeps two backups of one project from running at once.
    backup_locks: ProjectLocks,
    scheduler: ShutdownScheduler<Inner>,
    runner: CommandRunner,
    mounts: MountManager,
    backups: BackupEngine,
    hasher: ChangeHashTracker,
    health: HealthProbe,
    metadata: Arc<dyn ProjectMetadata>,
    store: Arc<dyn DurableStore>,
    auto_backups: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Kills of sandboxes whose load was dropped before registration.
    abandoned: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<Inner>,
}

/// Creates, reuses, backs up, and kills per-project sandboxes.
#[derive(Clone)]
pub(crate) struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub(crate) fn new(
        config: &Config,
        provider: Arc<dyn SandboxProvider>,
        metadata: Arc<dyn ProjectMetadata>,
        store: Arc<dyn DurableStore>,
        credentials: Option<StoreCredentials>,
    ) -> Self {
        let runner = CommandRunner::new(RetryPolicy::from(&config.retry));
        let excludes: Vec<String> = config
            .backup
            .exclude_dirs
            .iter()
            .chain(&config.backup.exclude_files)
            .cloned()
            .collect();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            settings: Settings {
                template: config.sandbox.template.clone(),
                port: config.sandbox.port,
                lease: config.sandbox.lease(),
                project_dir: config.sandbox.project_dir.clone(),
                install: config.install.clone(),
                backup_wait: config.backup.wait(),
                backup_poll: config.backup.wait_poll(),
                auto_interval: config.backup.auto_interval(),
            },
            provider,
            registry: SessionRegistry::default(),
            creation_locks: ProjectLocks::default(),
            backup_locks: ProjectLocks::default(),
            scheduler: ShutdownScheduler::new(weak.clone(), ShutdownTimings::from(&config.shutdown)),
            mounts: MountManager::new(runner.clone(), config.store.clone(), credentials),
            backups: BackupEngine::new(
                runner.clone(),
                config.sandbox.project_dir.clone(),
                config.store.mount_point.clone(),
                excludes,
                Arc::clone(&metadata),
            ),
            hasher: ChangeHashTracker::new(
                runner.clone(),
                config.sandbox.project_dir.clone(),
                config.backup.exclude_dirs.clone(),
                config.backup.exclude_files.clone(),
            ),
            runner,
            health: HealthProbe::new(&config.health),
            metadata,
            store,
            auto_backups: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        });
        Self { inner }
    }

    /// Builds a coordinator with the configured provider and host-side stores.
    pub(crate) async fn from_config(config: &Config, provider_override: Option<&str>) -> Result<Self> {
        let mut config = config.clone();
        config.store.local_root = absolute(&config.store.local_root)?
            .to_string_lossy()
            .into_owned();

        let kind = config.resolve_provider(provider_override)?;
        let provider: Arc<dyn SandboxProvider> = match kind {
            ProviderKind::Docker => Arc::new(
                DockerProvider::connect(config.sandbox.resources.clone(), config.sandbox.lease())
                    .context("Failed to connect to Docker")?,
            ),
            ProviderKind::Local => Arc::new(LocalProvider::new(
                absolute(&config.sandbox.state_dir)?,
                config.sandbox.port,
                config.sandbox.lease(),
            )),
        };
        info!("Using {} sandbox provider", provider.name());

        match provider.cleanup_orphaned().await {
            Ok(0) => {}
            Ok(n) => info!("Cleaned up {} sandboxes from a previous run", n),
            Err(e) => warn!("Orphan cleanup failed: {}", e),
        }

        let metadata = Arc::new(FileMetadataStore::new(absolute(&config.metadata.path)?));
        let store = Arc::new(LocalDurableStore::new(&config.store.local_root));
        let credentials = config.store.credentials();
        Ok(Self::new(&config, provider, metadata, store, credentials))
    }

    /// Returns the project's live sandbox, creating and preparing one if
    /// needed. Concurrent calls for one project share one sandbox.
    pub async fn load_or_create(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<LoadedSandbox, CoordinatorError> {
        check_id(project_id)?;
        check_id(user_id)?;

        let (session, created) = self.create_or_reuse(project_id, user_id).await?;
        let url = session.sandbox_url.clone();
        let ready = self.inner.health.wait_until_ready(&url).await;
        Ok(LoadedSandbox {
            session,
            url,
            created,
            ready,
        })
    }

    async fn create_or_reuse(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<(SandboxSession, bool), CoordinatorError> {
        if let Some(session) = self.inner.try_reuse(project_id).await {
            return Ok((session, false));
        }

        let _guard = self.inner.creation_locks.acquire(project_id).await;
        if let Some(session) = self.inner.try_reuse(project_id).await {
            return Ok((session, false));
        }

        info!(project = project_id, user = user_id, "Creating sandbox");
        let sandbox = self
            .inner
            .provider
            .create(&self.inner.settings.template)
            .await
            .map_err(|e| {
                error!(project = project_id, "Sandbox creation failed: {}", e);
                CoordinatorError::load_failed(project_id, e.to_string())
            })?;

        let unregistered = Unregistered::new(&self.inner, &sandbox);
        match self.inner.prepare(&sandbox, project_id, user_id).await {
            Ok(session) => {
                unregistered.disarm();
                Ok((session, true))
            }
            Err(e) => {
                error!(
                    sandbox = sandbox.id(),
                    project = project_id,
                    "Preparing sandbox failed, killing it: {}",
                    e
                );
                if let Err(kill_err) = sandbox.kill().await {
                    warn!(sandbox = sandbox.id(), "Compensating kill failed: {}", kill_err);
                }
                unregistered.disarm();
                Err(e)
            }
        }
    }

    /// Keeps the sandbox alive: cancels a pending shutdown and extends
    /// the lease.
    pub async fn refresh(&self, sandbox_id: &str) -> Result<(), CoordinatorError> {
        let sandbox = self
            .inner
            .registry
            .sandbox(sandbox_id)
            .ok_or_else(|| CoordinatorError::not_found(sandbox_id))?;

        self.inner.scheduler.cancel_pending_shutdown(sandbox_id);
        if let Err(e) = sandbox.set_timeout(self.inner.settings.lease).await {
            return Err(self.inner.sandbox_failed(sandbox_id, e).await);
        }
        debug!(sandbox = sandbox_id, "Refreshed");
        Ok(())
    }

    /// The user left: back up now and kill after the grace window.
    /// Returns whether a kill was armed.
    pub async fn notify_leaving(&self, sandbox_id: &str) -> Result<bool, CoordinatorError> {
        let session = self
            .inner
            .registry
            .get(sandbox_id)
            .ok_or_else(|| CoordinatorError::not_found(sandbox_id))?;
        let (user_id, project_id) = session
            .owner()
            .ok_or_else(|| CoordinatorError::missing_owner(sandbox_id))?;

        Ok(self
            .inner
            .scheduler
            .schedule_shutdown(sandbox_id, project_id, user_id)
            .await)
    }

    /// Records a tab visibility change. Hiding starts the hidden-tab
    /// watch; showing stops it and cancels any pending shutdown.
    pub fn visibility_change(&self, sandbox_id: &str, hidden: bool) -> Result<(), CoordinatorError> {
        self.inner
            .registry
            .update(sandbox_id, |s| {
                if hidden && !s.is_tab_hidden {
                    s.tab_hidden_since = Some(Utc::now());
                } else if !hidden {
                    s.tab_hidden_since = None;
                }
                s.is_tab_hidden = hidden;
            })
            .ok_or_else(|| CoordinatorError::not_found(sandbox_id))?;

        if hidden {
            self.inner.scheduler.tab_hidden(sandbox_id);
        } else {
            self.inner.scheduler.tab_visible(sandbox_id);
            self.inner.scheduler.cancel_pending_shutdown(sandbox_id);
        }
        Ok(())
    }

    /// Backs up and kills the sandbox now. The kill happens whatever the
    /// backup outcome; refused while generation is streaming.
    pub async fn delete(&self, sandbox_id: &str) -> Result<SyncOutcome, CoordinatorError> {
        let session = self
            .inner
            .registry
            .get(sandbox_id)
            .ok_or_else(|| CoordinatorError::not_found(sandbox_id))?;
        if session.is_streaming {
            return Err(CoordinatorError::streaming(sandbox_id));
        }

        self.inner.scheduler.forget(sandbox_id);
        let outcome = self.inner.backup_session(sandbox_id, None).await;
        if !outcome.is_success() {
            warn!(sandbox = sandbox_id, ?outcome, "Deleting without a fresh backup");
        }
        self.inner.reap(sandbox_id).await;
        info!(sandbox = sandbox_id, project = %session.project_id, "Sandbox deleted");
        Ok(outcome)
    }

    pub fn status(&self, project_id: &str) -> ProjectStatus {
        match self.inner.registry.find_by_project(project_id) {
            None => ProjectStatus::Ready,
            Some((session, _)) if session.is_backing_up => ProjectStatus::BackingUp,
            Some(_) => ProjectStatus::Active,
        }
    }

    pub fn session(&self, sandbox_id: &str) -> Option<SandboxSession> {
        self.inner.registry.get(sandbox_id)
    }

    pub fn sessions(&self) -> Vec<SandboxSession> {
        self.inner.registry.sessions()
    }

    pub fn shutdown_phase(&self, sandbox_id: &str) -> ShutdownPhase {
        self.inner.scheduler.phase(sandbox_id)
    }

    /// Whether a hidden-tab check is armed for this sandbox.
    pub fn is_watching_hidden(&self, sandbox_id: &str) -> bool {
        self.inner.scheduler.is_watching_hidden(sandbox_id)
    }

    /// The armed kill for this sandbox, if any.
    pub fn pending_shutdown(&self, sandbox_id: &str) -> Option<PendingShutdown> {
        self.inner.scheduler.pending(sandbox_id)
    }

    /// Marks the session as streaming until the guard is dropped.
    pub fn begin_streaming(&self, sandbox_id: &str) -> Result<StreamingGuard, CoordinatorError> {
        self.inner
            .registry
            .update(sandbox_id, |s| s.is_streaming = true)
            .ok_or_else(|| CoordinatorError::not_found(sandbox_id))?;
        debug!(sandbox = sandbox_id, "Streaming started");
        Ok(StreamingGuard {
            inner: Arc::downgrade(&self.inner),
            sandbox_id: sandbox_id.to_string(),
        })
    }

    /// Writes generated files under the project root. Every path is
    /// checked before anything is written.
    pub async fn write_files(
        &self,
        sandbox_id: &str,
        files: &[FileWrite],
    ) -> Result<Vec<String>, CoordinatorError> {
        let sandbox = self
            .inner
            .registry
            .sandbox(sandbox_id)
            .ok_or_else(|| CoordinatorError::not_found(sandbox_id))?;

        let project_dir = self.inner.settings.project_dir.trim_end_matches('/');
        let targets = files
            .iter()
            .map(|f| Ok((format!("{project_dir}/{}", project_relative(&f.path)?), f)))
            .collect::<Result<Vec<_>, CoordinatorError>>()?;

        let mut written = Vec::with_capacity(targets.len());
        for (path, file) in targets {
            if let Err(e) = sandbox
                .write_file(&sandbox.resolve(&path), file.contents.as_bytes())
                .await
            {
                return Err(self.inner.sandbox_failed(sandbox_id, e).await);
            }
            written.push(path);
        }
        debug!(sandbox = sandbox_id, "Wrote {} files", written.len());
        Ok(written)
    }

    /// Reads a file under the project root.
    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, CoordinatorError> {
        let (sandbox, path) = self.project_path(sandbox_id, Some(path))?;
        match sandbox.read_file(&sandbox.resolve(&path)).await {
            Ok(contents) => Ok(contents),
            Err(e) => Err(self.inner.sandbox_failed(sandbox_id, e).await),
        }
    }

    /// Lists entry names in a project directory; `None` lists the root.
    pub async fn list_dir(
        &self,
        sandbox_id: &str,
        path: Option<&str>,
    ) -> Result<Vec<String>, CoordinatorError> {
        let (sandbox, path) = self.project_path(sandbox_id, path)?;
        match sandbox.list_dir(&sandbox.resolve(&path)).await {
            Ok(names) => Ok(names),
            Err(e) => Err(self.inner.sandbox_failed(sandbox_id, e).await),
        }
    }

    fn project_path(
        &self,
        sandbox_id: &str,
        path: Option<&str>,
    ) -> Result<(Arc<dyn Sandbox>, String), CoordinatorError> {
        let sandbox = self
            .inner
            .registry
            .sandbox(sandbox_id)
            .ok_or_else(|| CoordinatorError::not_found(sandbox_id))?;
        let project_dir = self.inner.settings.project_dir.trim_end_matches('/');
        let path = match path {
            Some(path) => format!("{project_dir}/{}", project_relative(path)?),
            None => project_dir.to_string(),
        };
        Ok((sandbox, path))
    }

    /// Runs commands in the project dir, in order, once each.
    pub async fn run_commands(
        &self,
        sandbox_id: &str,
        commands: &[String],
    ) -> Result<Vec<CommandOutput>, CoordinatorError> {
        let sandbox = self
            .inner
            .registry
            .sandbox(sandbox_id)
            .ok_or_else(|| CoordinatorError::not_found(sandbox_id))?;
        let options = CommandOptions::in_dir(sandbox.resolve(&self.inner.settings.project_dir));

        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            match sandbox.run_command(command, &options).await {
                Ok(output) => outputs.push(output),
                Err(e) => return Err(self.inner.sandbox_failed(sandbox_id, e).await),
            }
        }
        Ok(outputs)
    }

    /// Permanently deletes a project's backup. Refused while the project
    /// has a live sandbox. Returns how many keys were removed.
    pub async fn purge(&self, user_id: &str, project_id: &str) -> Result<usize, CoordinatorError> {
        check_id(project_id)?;
        check_id(user_id)?;
        self.ensure_inactive(project_id)?;

        // Hold off creation while deleting
        let _guard = self.inner.creation_locks.acquire(project_id).await;
        self.ensure_inactive(project_id)?;

        let removed = purge_project(self.inner.store.as_ref(), user_id, project_id)
            .await
            .map_err(|e| CoordinatorError::store(&e))?;
        self.inner
            .metadata
            .forget(user_id, project_id)
            .await
            .map_err(|e| CoordinatorError::store(&e))?;
        info!(user = user_id, project = project_id, "Project purged");
        Ok(removed)
    }

    fn ensure_inactive(&self, project_id: &str) -> Result<(), CoordinatorError> {
        match self.inner.registry.find_by_project(project_id) {
            Some((session, _)) => Err(CoordinatorError::project_active(
                project_id,
                session.sandbox_id,
            )),
            None => Ok(()),
        }
    }

    /// Runs one auto-backup check now, reaping the session if the
    /// sandbox is gone.
    pub(crate) async fn auto_backup_tick(&self, sandbox_id: &str) -> AutoBackup {
        let result = self.inner.auto_backup_tick(sandbox_id).await;
        if result == AutoBackup::Unreachable {
            self.inner.reap(sandbox_id).await;
        }
        result
    }

    /// Backs up and kills every live sandbox. Returns how many were
    /// shut down.
    pub async fn shutdown_all(&self) -> usize {
        let abandoned = std::mem::take(&mut *self.inner.abandoned_kills());
        if !abandoned.is_empty() {
            info!("Waiting for {} abandoned sandboxes to die", abandoned.len());
            join_all(abandoned).await;
        }

        let ids: Vec<String> = self
            .inner
            .registry
            .sessions()
            .into_iter()
            .map(|s| s.sandbox_id)
            .collect();
        if ids.is_empty() {
            return 0;
        }
        info!(
            pending = self.inner.scheduler.pending_count(),
            "Shutting down {} sandboxes",
            ids.len()
        );

        join_all(ids.iter().map(|id| async move {
            self.inner.scheduler.forget(id);
            let outcome = self.inner.backup_session(id, None).await;
            if !outcome.is_success() {
                warn!(sandbox = %id, ?outcome, "Final backup did not complete");
            }
            self.inner.reap(id).await;
        }))
        .await;
        ids.len()
    }
}

impl Inner {
    /// Returns the project's live session after cancelling its pending
    /// shutdown, waiting out a running backup, and extending its lease.
    /// `None` means a new sandbox is needed.
    async fn try_reuse(&self, project_id: &str) -> Option<SandboxSession> {
        let (session, sandbox) = self.registry.find_by_project(project_id)?;
        let sandbox_id = session.sandbox_id.clone();

        if self.scheduler.cancel_pending_shutdown(&sandbox_id) {
            info!(sandbox = %sandbox_id, project = project_id, "Reused sandbox, shutdown cancelled");
        }

        if session.is_backing_up {
            let deadline = Instant::now() + self.settings.backup_wait;
            loop {
                match self.registry.get(&sandbox_id) {
                    None => return None,
                    Some(s) if !s.is_backing_up => break,
                    Some(_) if Instant::now() >= deadline => {
                        warn!(
                            sandbox = %sandbox_id,
                            "Backup still running after {:?}, proceeding",
                            self.settings.backup_wait
                        );
                        break;
                    }
                    Some(_) => tokio::time::sleep(self.settings.backup_poll).await,
                }
            }
        }

        if let Err(e) = sandbox.set_timeout(self.settings.lease).await {
            if e.is_unreachable() {
                warn!(sandbox = %sandbox_id, "Registered sandbox is gone, replacing it");
                self.reap(&sandbox_id).await;
                return None;
            }
            warn!(sandbox = %sandbox_id, "Could not extend lease: {}", e);
        }

        self.registry.get(&sandbox_id)
    }

    /// Restores, installs, and registers a freshly created sandbox.
    async fn prepare(
        &self,
        sandbox: &Arc<dyn Sandbox>,
        project_id: &str,
        user_id: &str,
    ) -> Result<SandboxSession, CoordinatorError> {
        let load_failed = |message: String| CoordinatorError::load_failed(project_id, message);
        let sandbox_id = sandbox.id().to_string();

        sandbox
            .set_timeout(self.settings.lease)
            .await
            .map_err(|e| load_failed(e.to_string()))?;

        let project_dir = sandbox.resolve(&self.settings.project_dir);
        let mkdir = format!("mkdir -p {}", shell_words::quote(&project_dir));
        let output = self
            .runner
            .run_until_success(sandbox.as_ref(), &mkdir, &CommandOptions::default())
            .await
            .map_err(|e| load_failed(e.to_string()))?;
        if !output.success() {
            return Err(load_failed(format!(
                "cannot create project dir: {}",
                output.stderr.trim()
            )));
        }

        let mounted = self.mounts.mount(sandbox.as_ref()).await;
        // Anything short of a finished restore leaves the store holding
        // files this sandbox lacks, so its backups must not mirror.
        let restore_pending = match self.metadata.has_backup(user_id, project_id).await {
            Ok(false) => false,
            Ok(true) if !mounted => {
                warn!(sandbox = %sandbox_id, "Store not mounted, project starts empty");
                true
            }
            Ok(true) => match self.backups.restore(sandbox.as_ref(), user_id, project_id).await {
                SyncOutcome::Unreachable => {
                    return Err(load_failed("sandbox died during restore".to_string()))
                }
                SyncOutcome::Synced { .. } | SyncOutcome::Skipped { .. } => false,
                outcome @ SyncOutcome::Failed { .. } => {
                    warn!(sandbox = %sandbox_id, ?outcome, "Continuing without a full restore");
                    true
                }
            },
            Err(e) => {
                warn!(project = project_id, "Cannot read backup record: {:#}", e);
                true
            }
        };
        if restore_pending {
            warn!(
                sandbox = %sandbox_id,
                project = project_id,
                "Backups of this sandbox will not delete from the store"
            );
        }

        self.run_install(sandbox.as_ref(), &project_dir)
            .await
            .map_err(|e| load_failed(e.to_string()))?;

        let mut session = SandboxSession::new(
            &sandbox_id,
            project_id,
            user_id,
            sandbox.url_for_port(self.settings.port),
        );
        session.restore_pending = restore_pending;
        session.last_code_hash = self
            .hasher
            .hash(sandbox.as_ref())
            .await
            .map_err(|e| load_failed(e.to_string()))?;

        self.registry.insert(session.clone(), Arc::clone(sandbox))?;
        self.start_auto_backup(&sandbox_id);
        info!(
            sandbox = %sandbox_id,
            project = project_id,
            url = %session.sandbox_url,
            "Sandbox ready"
        );
        Ok(session)
    }

    /// Runs the install step and starts the long-running service. Only an
    /// unreachable sandbox is an error; a failed install is logged.
    async fn run_install(
        &self,
        sandbox: &dyn Sandbox,
        project_dir: &str,
    ) -> Result<(), SandboxError> {
        let install = &self.settings.install;
        let options = CommandOptions::in_dir(project_dir)
            .with_timeout(Duration::from_secs(install.timeout_secs));

        if let Some(command) = install.command.as_deref().filter(|c| !c.trim().is_empty()) {
            match sandbox.run_command(command, &options).await {
                Ok(output) if output.success() => debug!(sandbox = sandbox.id(), "Install finished"),
                Ok(output) => warn!(
                    sandbox = sandbox.id(),
                    exit_code = output.exit_code,
                    "Install failed: {}",
                    output.stderr.trim()
                ),
                Err(e) if e.is_unreachable() => return Err(e),
                Err(e) => warn!(sandbox = sandbox.id(), "Install failed: {}", e),
            }
        }

        if let Some(command) = install.start_command.as_deref().filter(|c| !c.trim().is_empty()) {
            let background = format!(
                "nohup sh -c {} >/dev/null 2>&1 &",
                shell_words::quote(command)
            );
            match sandbox
                .run_command(&background, &CommandOptions::in_dir(project_dir))
                .await
            {
                Ok(_) => debug!(sandbox = sandbox.id(), "Service started"),
                Err(e) if e.is_unreachable() => return Err(e),
                Err(e) => warn!(sandbox = sandbox.id(), "Could not start service: {}", e),
            }
        }
        Ok(())
    }

    /// Ensures the mount and backs the session's project up, one backup
    /// per project at a time. `fingerprint` is the project hash if the
    /// caller already took it; otherwise it is taken here.
    async fn backup_session(&self, sandbox_id: &str, fingerprint: Option<String>) -> SyncOutcome {
        let Some((session, sandbox)) = self.registry.entry(sandbox_id) else {
            return SyncOutcome::Skipped {
                reason: "no session".to_string(),
            };
        };
        let Some((user_id, project_id)) = session.owner() else {
            warn!(sandbox = sandbox_id, "Session has no owner, not backing up");
            return SyncOutcome::Skipped {
                reason: "no owner".to_string(),
            };
        };

        let _guard = self.backup_locks.acquire(project_id).await;
        let fingerprint = match fingerprint {
            Some(hash) => Some(hash),
            None => match self.hasher.hash(sandbox.as_ref()).await {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(sandbox = sandbox_id, "Sandbox unreachable before backup: {}", e);
                    return SyncOutcome::Unreachable;
                }
            },
        };
        let mode = if session.restore_pending {
            BackupMode::Additive
        } else {
            BackupMode::Mirror
        };
        self.registry.update(sandbox_id, |s| s.is_backing_up = true);

        let outcome = if self.mounts.ensure_mounted(sandbox.as_ref()).await {
            self.backups
                .backup(sandbox.as_ref(), user_id, project_id, mode)
                .await
        } else {
            error!(sandbox = sandbox_id, "Durable store not mounted, backup skipped");
            SyncOutcome::Failed {
                reason: "durable store not mounted".to_string(),
            }
        };

        self.registry.update(sandbox_id, |s| {
            s.is_backing_up = false;
            if let SyncOutcome::Synced { at, .. } = &outcome {
                s.last_backup_at = Some(*at);
                if fingerprint.is_some() {
                    s.last_code_hash = fingerprint;
                }
            }
        });
        outcome
    }

    /// Removes the session and kills its sandbox, tolerating either being
    /// gone already.
    async fn kill_session(&self, sandbox_id: &str) {
        self.stop_auto_backup(sandbox_id);
        let Some((session, sandbox)) = self.registry.remove(sandbox_id) else {
            debug!(sandbox = sandbox_id, "Kill of unknown session ignored");
            return;
        };
        match sandbox.kill().await {
            Ok(()) => info!(sandbox = sandbox_id, project = %session.project_id, "Sandbox killed"),
            Err(e) => warn!(sandbox = sandbox_id, "Kill failed, dropping session anyway: {}", e),
        }
    }

    /// Reaps the session if `err` says its sandbox is gone.
    async fn sandbox_failed(&self, sandbox_id: &str, err: SandboxError) -> CoordinatorError {
        if err.is_unreachable() {
            warn!(sandbox = sandbox_id, "Sandbox is gone, reaping session: {}", err);
            self.reap(sandbox_id).await;
        }
        err.into()
    }

    /// Kills the session and drops every timer for it.
    async fn reap(&self, sandbox_id: &str) {
        self.scheduler.forget(sandbox_id);
        self.kill_session(sandbox_id).await;
    }

    async fn auto_backup_tick(&self, sandbox_id: &str) -> AutoBackup {
        let Some((session, sandbox)) = self.registry.entry(sandbox_id) else {
            return AutoBackup::Gone;
        };
        if session.is_shutting_down {
            return AutoBackup::ShuttingDown;
        }

        let hash = match self.hasher.hash(sandbox.as_ref()).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(sandbox = sandbox_id, "Sandbox unreachable during auto-backup: {}", e);
                return AutoBackup::Unreachable;
            }
        };
        if hash.is_some() && hash == session.last_code_hash {
            debug!(sandbox = sandbox_id, "No changes since last backup");
            return AutoBackup::Unchanged;
        }

        match self.backup_session(sandbox_id, hash).await {
            SyncOutcome::Unreachable => AutoBackup::Unreachable,
            outcome => AutoBackup::BackedUp(outcome),
        }
    }

    fn start_auto_backup(&self, sandbox_id: &str) {
        let Some(interval) = self.settings.auto_interval else {
            return;
        };

        let id = sandbox_id.to_string();
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match inner.auto_backup_tick(&id).await {
                    AutoBackup::Gone => {
                        inner.auto_backups_table().remove(&id);
                        return;
                    }
                    AutoBackup::Unreachable => {
                        // Detach before reaping so the reap cannot abort this task
                        inner.auto_backups_table().remove(&id);
                        inner.reap(&id).await;
                        return;
                    }
                    _ => {}
                }
            }
        });

        if let Some(previous) = self.auto_backups_table().insert(sandbox_id.to_string(), handle) {
            previous.abort();
        }
        debug!(sandbox = sandbox_id, "Auto-backup every {:?}", interval);
    }

    fn stop_auto_backup(&self, sandbox_id: &str) {
        if let Some(handle) = self.auto_backups_table().remove(sandbox_id) {
            handle.abort();
        }
    }

    fn abandoned_kills(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.abandoned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auto_backups_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.auto_backups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl ShutdownHooks for Inner {
    fn scheduler(&self) -> &ShutdownScheduler<Self> {
        &self.scheduler
    }

    fn session(&self, sandbox_id: &str) -> Option<SandboxSession> {
        self.registry.get(sandbox_id)
    }

    fn set_shutting_down(&self, sandbox_id: &str, shutting_down: bool) {
        self.registry
            .update(sandbox_id, |s| s.is_shutting_down = shutting_down);
    }

    async fn backup(&self, sandbox_id: &str) -> SyncOutcome {
        self.backup_session(sandbox_id, None).await
    }

    async fn extend_lease(&self, sandbox_id: &str, lease: Duration) {
        let Some(sandbox) = self.registry.sandbox(sandbox_id) else {
            return;
        };
        if let Err(e) = sandbox.set_timeout(lease).await {
            warn!(sandbox = sandbox_id, "Could not extend lease for shutdown: {}", e);
        }
    }

    async fn kill(&self, sandbox_id: &str) {
        self.kill_session(sandbox_id).await;
    }
}

/// A created sandbox that is not in the registry yet. Dropping it armed,
/// e.g. when the load future is cancelled, kills the sandbox in the
/// background.
struct Unregistered {
    inner: Weak<Inner>,
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl Unregistered {
    fn new(inner: &Arc<Inner>, sandbox: &Arc<dyn Sandbox>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            sandbox: Some(Arc::clone(sandbox)),
        }
    }

    fn disarm(mut self) {
        self.sandbox = None;
    }
}

impl Drop for Unregistered {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(sandbox = sandbox.id(), "Load abandoned outside a runtime, sandbox leaked");
            return;
        };
        warn!(sandbox = sandbox.id(), "Load abandoned before registration, killing sandbox");
        let handle = runtime.spawn(async move {
            if let Err(e) = sandbox.kill().await {
                warn!(sandbox = sandbox.id(), "Kill of abandoned sandbox failed: {}", e);
            }
        });
        if let Some(inner) = self.inner.upgrade() {
            let mut abandoned = inner.abandoned_kills();
            abandoned.retain(|h| !h.is_finished());
            abandoned.push(handle);
        }
    }
}

/// Clears the session's streaming flag when dropped.
#[derive(Debug)]
pub struct StreamingGuard {
    inner: Weak<Inner>,
    sandbox_id: String,
}

impl StreamingGuard {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .registry
                .update(&self.sandbox_id, |s| s.is_streaming = false);
            debug!(sandbox = %self.sandbox_id, "Streaming finished");
        }
    }
}

/// Rejects ids that could not be used as a single store path segment.
fn check_id(id: &str) -> Result<(), CoordinatorError> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        Err(CoordinatorError::invalid_path(id))
    } else {
        Ok(())
    }
}

/// Normalizes a path relative to the project root, rejecting absolute
/// paths and `..` components.
pub(crate) fn project_relative(path: &str) -> Result<String, CoordinatorError> {
    if path.starts_with('/') || path.contains(['\\', '\0']) {
        return Err(CoordinatorError::invalid_path(path));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(CoordinatorError::invalid_path(path)),
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(CoordinatorError::invalid_path(path));
    }
    Ok(parts.join("/"))
}

fn absolute(path: &str) -> Result<PathBuf> {
    let path = expand_path(path)?;
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()
            .context("Could not determine current directory")?
            .join(path))
    }
}

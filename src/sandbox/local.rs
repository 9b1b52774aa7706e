//! Host-directory sandboxes for development and tests.
//!
//! Each sandbox is a directory under the provider's state dir. Sandbox
//! paths are rooted inside that directory and commands run through
//! `sh -c` on the host. There is no isolation at all; this exists so the
//! coordinator can be exercised without Docker.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lease::Lease;
use super::{CommandOptions, CommandOutput, Sandbox, SandboxError, SandboxProvider};

/// Attached directories never expire in practice.
const ATTACHED_LEASE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A sandbox backed by a host directory.
#[derive(Debug)]
pub(crate) struct LocalSandbox {
    id: String,
    root: PathBuf,
    port: u16,
    /// Whether killing the sandbox removes `root`.
    owned: bool,
    alive: AtomicBool,
    lease: Arc<Lease>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl LocalSandbox {
    /// Wraps an existing host directory without taking ownership of it.
    ///
    /// Sandbox paths map one-to-one onto host paths below `root`; pass `/`
    /// to address host paths directly. Killing an attached sandbox never
    /// deletes anything.
    pub fn attach(root: impl Into<PathBuf>) -> Self {
        Self {
            id: "local-attached".to_string(),
            root: root.into(),
            port: 0,
            owned: false,
            alive: AtomicBool::new(true),
            lease: Lease::new(ATTACHED_LEASE),
            watchdog: Mutex::new(None),
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SandboxError::unreachable(&self.id, "sandbox was killed"))
        }
    }

    fn io_error(&self, action: &str, path: &str, err: &std::io::Error) -> SandboxError {
        SandboxError::operation_failed(format!("{action} {path} in {}: {err}", self.id))
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn url_for_port(&self, port: u16) -> String {
        let port = if port == 0 { self.port } else { port };
        format!("http://127.0.0.1:{port}")
    }

    fn resolve(&self, path: &str) -> String {
        self.host_path(path).to_string_lossy().into_owned()
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if self.owned {
            match tokio::fs::remove_dir_all(&self.root).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(sandbox = %self.id, "Failed to remove sandbox root: {}", e),
            }
        }
        if let Some(watchdog) = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watchdog.abort();
        }
        debug!(sandbox = %self.id, "Local sandbox killed");
        Ok(())
    }

    async fn set_timeout(&self, lease: Duration) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        self.lease.extend(lease);
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutput, SandboxError> {
        self.ensure_alive()?;

        let cwd = options
            .cwd
            .as_deref()
            .map_or_else(|| self.root.clone(), |dir| self.host_path(dir));

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env("SANDBOX_ROOT", &self.root)
            .kill_on_drop(true)
            .output();

        let output = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, child)
                .await
                .map_err(|_| SandboxError::timeout(limit))?,
            None => child.await,
        }
        .map_err(|e| {
            SandboxError::operation_failed(format!("failed to spawn shell in {}: {e}", cwd.display()))
        })?;

        Ok(CommandOutput {
            exit_code: i64::from(output.status.code().unwrap_or(-1)),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let target = self.host_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("create parent of", path, &e))?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(|e| self.io_error("write", path, &e))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.ensure_alive()?;
        tokio::fs::read(self.host_path(path))
            .await
            .map_err(|e| self.io_error("read", path, &e))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        self.ensure_alive()?;
        let mut entries = tokio::fs::read_dir(self.host_path(path))
            .await
            .map_err(|e| self.io_error("list", path, &e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.io_error("list", path, &e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// Creates [`LocalSandbox`]es under `{state_dir}/sandboxes`.
#[derive(Debug, Clone)]
pub(crate) struct LocalProvider {
    state_dir: PathBuf,
    port: u16,
    initial_lease: Duration,
}

impl LocalProvider {
    pub fn new(state_dir: impl Into<PathBuf>, port: u16, initial_lease: Duration) -> Self {
        Self {
            state_dir: state_dir.into(),
            port,
            initial_lease,
        }
    }

    fn sandboxes_dir(&self) -> PathBuf {
        self.state_dir.join("sandboxes")
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, template: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let id = format!("local-{}", short_id());
        let root = self.sandboxes_dir().join(&id);
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            SandboxError::create_failed(format!("cannot create {}: {e}", root.display()))
        })?;

        debug!(sandbox = %id, template, "Created local sandbox at {}", root.display());

        let sandbox = Arc::new(LocalSandbox {
            id: id.clone(),
            root,
            port: self.port,
            owned: true,
            alive: AtomicBool::new(true),
            lease: Lease::new(self.initial_lease),
            watchdog: Mutex::new(None),
        });

        let weak: Weak<LocalSandbox> = Arc::downgrade(&sandbox);
        let watchdog = sandbox.lease.watch(id, move || async move {
            if let Some(sandbox) = weak.upgrade() {
                let _ = sandbox.kill().await;
            }
        });
        *sandbox
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watchdog);

        Ok(sandbox)
    }

    async fn cleanup_orphaned(&self) -> Result<u32, SandboxError> {
        let dir = self.sandboxes_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(SandboxError::operation_failed(format!(
                    "cannot list {}: {e}",
                    dir.display()
                )))
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_sandbox_root(&path) && tokio::fs::remove_dir_all(&path).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} orphaned local sandboxes", removed);
        }
        Ok(removed)
    }
}

fn is_sandbox_root(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("local-"))
}

/// First segment of a v4 UUID, enough to tell sandboxes apart in logs.
pub(crate) fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

//! Docker-backed sandboxes.
//!
//! Each sandbox is a long-lived container kept alive with `sleep infinity`.
//! Commands run through `docker exec`, files move as tar archives, and
//! an idle lease watchdog removes the container when nobody extends it.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::{DeviceMapping, HostConfig};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lease::Lease;
use super::local::short_id;
use super::{
    CommandOptions, CommandOutput, Sandbox, SandboxError, SandboxProvider, MANAGED_LABEL,
};
use crate::config::ResourceConfig;

/// Maps a bollard error onto the sandbox error taxonomy.
///
/// 404 means the container is gone and 409 means it is not running;
/// both are terminal. Anything else is treated as a flaky channel.
fn classify(sandbox_id: &str, err: DockerError) -> SandboxError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            message,
        } => SandboxError::unreachable(sandbox_id, message),
        other => SandboxError::transport(other.to_string()),
    }
}

/// A running container.
pub(crate) struct DockerSandbox {
    docker: Docker,
    name: String,
    host: String,
    alive: AtomicBool,
    lease: Arc<Lease>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl DockerSandbox {
    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SandboxError::unreachable(&self.name, "container was removed"))
        }
    }

    async fn exec(&self, command: &str, options: &CommandOptions) -> Result<CommandOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    working_dir: options.cwd.as_deref(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(&self.name, e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(&self.name, e))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => return Err(classify(&self.name, e)),
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(&self.name, e))?;

        Ok(CommandOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.name
    }

    fn url_for_port(&self, port: u16) -> String {
        format!("http://{}:{port}", self.host)
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .docker
            .remove_container(
                &self.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        if let Some(watchdog) = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watchdog.abort();
        }

        match result.map_err(|e| classify(&self.name, e)) {
            Ok(()) => {
                debug!(sandbox = %self.name, "Container removed");
                Ok(())
            }
            // Already gone is what we wanted
            Err(e) if e.is_unreachable() => Ok(()),
            Err(e) => Err(e),
        }
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
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exec(command, options))
                .await
                .map_err(|_| SandboxError::timeout(limit))?,
            None => self.exec(command, options).await,
        }
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.ensure_alive()?;

        let (dir, file_name) = match path.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => return Err(SandboxError::operation_failed(format!("not an absolute path: {path}"))),
        };

        // The upload target directory must exist
        let mkdir = format!("mkdir -p {}", shell_words::quote(dir));
        let created = self.exec(&mkdir, &CommandOptions::default()).await?;
        if !created.success() {
            return Err(SandboxError::operation_failed(format!(
                "mkdir {dir} failed: {}",
                created.stderr.trim()
            )));
        }

        let mut tar_buf = Vec::new();
        {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            let mut tar = tar::Builder::new(&mut tar_buf);
            tar.append_data(&mut header, file_name, contents)
                .map_err(|e| SandboxError::operation_failed(format!("tar {path}: {e}")))?;
            tar.finish()
                .map_err(|e| SandboxError::operation_failed(format!("tar {path}: {e}")))?;
        }

        self.docker
            .upload_to_container(
                &self.name,
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                Bytes::from(tar_buf),
            )
            .await
            .map_err(|e| classify(&self.name, e))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.ensure_alive()?;

        let mut stream = self.docker.download_from_container(
            &self.name,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(|e| classify(&self.name, e))?);
        }

        let mut tar = tar::Archive::new(archive.as_slice());
        let mut entries = tar
            .entries()
            .map_err(|e| SandboxError::operation_failed(format!("untar {path}: {e}")))?;
        let mut entry = entries
            .next()
            .ok_or_else(|| SandboxError::operation_failed(format!("empty archive for {path}")))?
            .map_err(|e| SandboxError::operation_failed(format!("untar {path}: {e}")))?;

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| SandboxError::operation_failed(format!("untar {path}: {e}")))?;
        Ok(contents)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        self.ensure_alive()?;
        let output = self
            .exec(
                &format!("ls -1A {}", shell_words::quote(path)),
                &CommandOptions::default(),
            )
            .await?;
        if !output.success() {
            return Err(SandboxError::operation_failed(format!(
                "ls {path} failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.lines().map(str::to_string).collect())
    }
}

/// Creates containers from an image template.
pub(crate) struct DockerProvider {
    docker: Docker,
    resources: ResourceConfig,
    initial_lease: Duration,
}

impl DockerProvider {
    /// Connects to the local Docker daemon.
    pub fn connect(resources: ResourceConfig, initial_lease: Duration) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::create_failed(format!("Failed to connect to Docker. Is Docker running? {e}"))
        })?;
        Ok(Self {
            docker,
            resources,
            initial_lease,
        })
    }

    fn build_container_config(&self, image: &str) -> Result<ContainerConfig<String>, SandboxError> {
        let memory = parse_memory_limit(&self.resources.memory)?;
        let cpus = self.resources.cpus.parse::<f64>().unwrap_or(2.0);
        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (cpus * 1_000_000_000.0) as i64;

        Ok(ContainerConfig {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                // FUSE mounts of the durable store need the device and SYS_ADMIN
                cap_add: Some(vec!["SYS_ADMIN".to_string()]),
                devices: Some(vec![DeviceMapping {
                    path_on_host: Some("/dev/fuse".to_string()),
                    path_in_container: Some("/dev/fuse".to_string()),
                    cgroup_permissions: Some("rwm".to_string()),
                }]),
                security_opt: Some(vec!["apparmor:unconfined".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn container_host(&self, name: &str) -> String {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .network_settings
                .and_then(|n| n.ip_address)
                .filter(|ip| !ip.is_empty())
                .unwrap_or_else(|| name.to_string()),
            Err(e) => {
                warn!(sandbox = %name, "Failed to inspect container: {}", e);
                name.to_string()
            }
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, template: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let name = format!("sandvault-{}", short_id());
        let config = self.build_container_config(template)?;

        debug!("Creating container {} from {}", name, template);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::create_failed(format!("create {name}: {e}")))?;

        if let Err(e) = self.docker.start_container::<String>(&name, None).await {
            let _ = self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(SandboxError::create_failed(format!("start {name}: {e}")));
        }

        let host = self.container_host(&name).await;
        info!(sandbox = %name, "Container started at {}", host);

        let sandbox = Arc::new(DockerSandbox {
            docker: self.docker.clone(),
            name: name.clone(),
            host,
            alive: AtomicBool::new(true),
            lease: Lease::new(self.initial_lease),
            watchdog: Mutex::new(None),
        });

        let weak: Weak<DockerSandbox> = Arc::downgrade(&sandbox);
        let watchdog = sandbox.lease.watch(name, move || async move {
            if let Some(sandbox) = weak.upgrade() {
                if let Err(e) = sandbox.kill().await {
                    warn!("Failed to remove expired container: {}", e);
                }
            }
        });
        *sandbox
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watchdog);

        Ok(sandbox)
    }

    async fn cleanup_orphaned(&self) -> Result<u32, SandboxError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: HashMap::from([(
                    "label".to_string(),
                    vec![format!("{MANAGED_LABEL}=true")],
                )]),
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::transport(e.to_string()))?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            let result = self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphaned container {}: {}", id, e),
            }
        }
        if removed > 0 {
            info!("Removed {} orphaned sandbox containers", removed);
        }
        Ok(removed)
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, SandboxError> {
    let limit = limit.to_lowercase();
    let invalid = |_| SandboxError::create_failed(format!("Invalid memory limit: {limit}"));

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(invalid)?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(invalid)?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().map_err(invalid)
    }
}

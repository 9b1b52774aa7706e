//! FUSE mount of the durable store inside a sandbox.
//!
//! A mount can go stale without anyone noticing, typically when the
//! sandbox is paused and resumed. Every backup path probes first and
//! remounts on demand.

use tracing::{debug, error, info, warn};

use crate::config::{StoreConfig, StoreCredentials};
use crate::runner::CommandRunner;
use crate::sandbox::{CommandOptions, Sandbox};

/// Mounts and verifies the durable store.
#[derive(Debug, Clone)]
pub(crate) struct MountManager {
    runner: CommandRunner,
    store: StoreConfig,
    credentials: Option<StoreCredentials>,
}

impl MountManager {
    pub fn new(
        runner: CommandRunner,
        store: StoreConfig,
        credentials: Option<StoreCredentials>,
    ) -> Self {
        Self {
            runner,
            store,
            credentials,
        }
    }

    /// Mount point as seen by `sandbox`'s commands.
    pub fn mount_point(&self, sandbox: &dyn Sandbox) -> String {
        sandbox.resolve(&self.store.mount_point)
    }

    /// Fills a command template for `sandbox`, shell-quoting every value.
    fn render(&self, sandbox: &dyn Sandbox, template: &str) -> String {
        let quote = |s: &str| shell_words::quote(s).into_owned();
        template
            .replace("{bucket}", &quote(&self.store.bucket))
            .replace("{endpoint}", &quote(&self.store.endpoint))
            .replace("{local_root}", &quote(&self.store.local_root))
            .replace("{mount_point}", &quote(&self.mount_point(sandbox)))
            .replace(
                "{credentials_file}",
                &quote(&sandbox.resolve(&self.store.credentials_file)),
            )
    }

    /// Creates the mount point, installs credentials, and mounts.
    ///
    /// Returns false on any failure; the reason is logged.
    pub async fn mount(&self, sandbox: &dyn Sandbox) -> bool {
        let mount_point = self.mount_point(sandbox);
        let options = CommandOptions::default();

        let mkdir = format!("mkdir -p {}", shell_words::quote(&mount_point));
        match self.runner.run_until_success(sandbox, &mkdir, &options).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                error!(
                    sandbox = sandbox.id(),
                    "Cannot create mount point {}: {}",
                    mount_point,
                    output.stderr.trim()
                );
                return false;
            }
            Err(e) => {
                error!(sandbox = sandbox.id(), "Cannot create mount point: {}", e);
                return false;
            }
        }

        if let Some(creds) = &self.credentials {
            if !self.install_credentials(sandbox, creds).await {
                return false;
            }
        } else {
            warn!(
                sandbox = sandbox.id(),
                "No store credentials in {} / {}; mounting without them",
                self.store.access_key_env,
                self.store.secret_key_env
            );
        }

        let command = self.render(sandbox, &self.store.mount_command);
        debug!(sandbox = sandbox.id(), "Mounting store: {}", command);
        match self.runner.run_until_success(sandbox, &command, &options).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                error!(
                    sandbox = sandbox.id(),
                    exit_code = output.exit_code,
                    "Mount command failed: {}",
                    output.stderr.trim()
                );
                return false;
            }
            Err(e) => {
                error!(sandbox = sandbox.id(), "Mount command failed: {}", e);
                return false;
            }
        }

        let mounted = self.is_mounted(sandbox).await;
        if mounted {
            info!(sandbox = sandbox.id(), "Durable store mounted at {}", mount_point);
        } else {
            error!(sandbox = sandbox.id(), "Mount command succeeded but probe failed");
        }
        mounted
    }

    async fn install_credentials(&self, sandbox: &dyn Sandbox, creds: &StoreCredentials) -> bool {
        let path = sandbox.resolve(&self.store.credentials_file);
        let contents = format!("{}:{}\n", creds.access_key, creds.secret_key);
        if let Err(e) = sandbox.write_file(&path, contents.as_bytes()).await {
            error!(sandbox = sandbox.id(), "Cannot write store credentials: {}", e);
            return false;
        }
        let chmod = format!("chmod 600 {}", shell_words::quote(&path));
        match self
            .runner
            .run_until_success(sandbox, &chmod, &CommandOptions::default())
            .await
        {
            Ok(output) if output.success() => true,
            Ok(output) => {
                error!(
                    sandbox = sandbox.id(),
                    "Cannot restrict credentials file: {}",
                    output.stderr.trim()
                );
                false
            }
            Err(e) => {
                error!(sandbox = sandbox.id(), "Cannot restrict credentials file: {}", e);
                false
            }
        }
    }

    /// Probes the mount point.
    pub async fn is_mounted(&self, sandbox: &dyn Sandbox) -> bool {
        let probe = self.render(sandbox, &self.store.probe_command);
        match self
            .runner
            .check(sandbox, &probe, &CommandOptions::default())
            .await
        {
            Ok(mounted) => mounted,
            Err(e) => {
                debug!(sandbox = sandbox.id(), "Mount probe failed: {}", e);
                false
            }
        }
    }

    /// Returns true if the store is mounted, remounting a stale mount.
    pub async fn ensure_mounted(&self, sandbox: &dyn Sandbox) -> bool {
        if self.is_mounted(sandbox).await {
            return true;
        }

        warn!(sandbox = sandbox.id(), "Durable store mount is stale, remounting");
        let unmount = self.render(sandbox, &self.store.unmount_command);
        if let Err(e) = sandbox
            .run_command(&unmount, &CommandOptions::default())
            .await
        {
            debug!(sandbox = sandbox.id(), "Ignoring unmount error: {}", e);
        }
        self.mount(sandbox).await
    }
}

//! Sandbox handles and the providers that create them.
//!
//! A sandbox is an opaque, network-addressable unit of compute with its
//! own filesystem. The coordinator only ever talks to it through the
//! [`Sandbox`] trait; how it is provisioned is the provider's business.

mod docker;
mod error;
mod lease;
mod local;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use docker::DockerProvider;
pub use error::SandboxError;
pub(crate) use local::{LocalProvider, LocalSandbox};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Label applied to every sandbox this process creates.
pub(crate) const MANAGED_LABEL: &str = "sandvault.managed";

/// Options for a single command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandOptions {
    /// Working directory, as a sandbox path.
    pub cwd: Option<String>,
    /// Upper bound on how long the command may run.
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    /// Runs in the given directory.
    pub fn in_dir(cwd: impl Into<String>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            timeout: None,
        }
    }

    /// Sets the command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a command that ran to completion inside a sandbox.
///
/// A non-zero exit code is not an error at this level; callers decide
/// what each code means.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live sandbox handle.
#[async_trait]
pub(crate) trait Sandbox: Send + Sync {
    /// Provider-assigned identity of this sandbox.
    fn id(&self) -> &str;

    /// Network address of a service listening on `port` inside the sandbox.
    fn url_for_port(&self, port: u16) -> String;

    /// Translates a sandbox-absolute path into the path this sandbox's
    /// commands operate on. Identity for real isolated sandboxes.
    fn resolve(&self, path: &str) -> String {
        path.to_string()
    }

    /// Destroys the sandbox and everything in it.
    async fn kill(&self) -> Result<(), SandboxError>;

    /// Resets the idle lease: the sandbox dies if not extended within `lease`.
    async fn set_timeout(&self, lease: Duration) -> Result<(), SandboxError>;

    /// Runs a shell command and waits for it to exit.
    async fn run_command(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutput, SandboxError>;

    /// Writes `contents` to `path`, creating parent directories.
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError>;

    /// Reads the file at `path`.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Lists entry names directly under `path`.
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, SandboxError>;
}

/// Creates sandboxes from a template.
#[async_trait]
pub(crate) trait SandboxProvider: Send + Sync {
    /// Returns the provider name for display.
    fn name(&self) -> &'static str;

    /// Creates and starts a new sandbox from `template`.
    async fn create(&self, template: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;

    /// Removes sandboxes left behind by a previous process.
    ///
    /// Returns the number removed.
    async fn cleanup_orphaned(&self) -> Result<u32, SandboxError> {
        Ok(0)
    }
}

/// Supported sandbox providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum ProviderKind {
    /// Docker containers via the local daemon.
    #[default]
    Docker,
    /// Host directories, for development without Docker.
    Local,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            _ => anyhow::bail!("Unknown sandbox provider: '{s}'. Supported: docker, local"),
        }
    }
}

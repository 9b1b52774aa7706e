use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::sandbox::ProviderKind;

pub(crate) const CONFIG_FILE: &str = "sandvault.toml";

/// Environment variable that overrides `[sandbox].provider`.
pub(crate) const PROVIDER_ENV: &str = "SANDVAULT_PROVIDER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

/// Where sandboxes come from and how they are laid out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Which provider creates sandboxes: "docker" or "local"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Template the provider boots from (the image for docker)
    #[serde(default = "default_template")]
    pub template: String,

    /// Port of the project's dev server inside the sandbox
    #[serde(default = "default_port")]
    pub port: u16,

    /// Idle lease granted on create, reuse, and refresh
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Project root inside every sandbox
    #[serde(default = "default_project_dir")]
    pub project_dir: String,

    /// Host directory for local sandboxes and other process state
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            template: default_template(),
            port: default_port(),
            lease_secs: default_lease_secs(),
            project_dir: default_project_dir(),
            state_dir: default_state_dir(),
            resources: ResourceConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Parse the provider string into a `ProviderKind`
    pub fn get_provider(&self) -> Result<ProviderKind> {
        self.provider.parse()
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "4g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

/// Durable object store, mounted inside sandboxes with a FUSE driver.
///
/// Command templates accept `{bucket}`, `{endpoint}`, `{mount_point}`,
/// `{credentials_file}` and `{local_root}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Mount point inside the sandbox
    #[serde(default = "default_mount_point")]
    pub mount_point: String,

    /// Where credentials are written inside the sandbox
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,

    /// Host environment variable holding the access key
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,

    /// Host environment variable holding the secret key
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,

    #[serde(default = "default_mount_command")]
    pub mount_command: String,

    /// Exits 0 only while the mount is live
    #[serde(default = "default_probe_command")]
    pub probe_command: String,

    #[serde(default = "default_unmount_command")]
    pub unmount_command: String,

    /// Host directory used for out-of-band listing and purging
    #[serde(default = "default_local_root")]
    pub local_root: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            endpoint: default_endpoint(),
            mount_point: default_mount_point(),
            credentials_file: default_credentials_file(),
            access_key_env: default_access_key_env(),
            secret_key_env: default_secret_key_env(),
            mount_command: default_mount_command(),
            probe_command: default_probe_command(),
            unmount_command: default_unmount_command(),
            local_root: default_local_root(),
        }
    }
}

/// Credentials for the durable store.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct StoreCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl StoreConfig {
    /// Reads credentials from the configured environment variables.
    pub(crate) fn credentials(&self) -> Option<StoreCredentials> {
        let access_key = std::env::var(&self.access_key_env).ok()?;
        let secret_key = std::env::var(&self.secret_key_env).ok()?;
        if access_key.is_empty() || secret_key.is_empty() {
            return None;
        }
        Some(StoreCredentials {
            access_key,
            secret_key,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory names never synced or hashed, at any depth
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,

    /// File names never synced or hashed, at any depth
    #[serde(default = "default_exclude_files")]
    pub exclude_files: Vec<String>,

    /// Seconds between change checks for auto-backup (0 = disabled)
    #[serde(default = "default_auto_interval_secs")]
    pub auto_interval_secs: u64,

    /// How long a reuse waits for an in-progress backup
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            exclude_dirs: default_exclude_dirs(),
            exclude_files: default_exclude_files(),
            auto_interval_secs: default_auto_interval_secs(),
            wait_secs: default_wait_secs(),
            wait_poll_ms: default_wait_poll_ms(),
        }
    }
}

impl BackupConfig {
    pub fn auto_interval(&self) -> Option<Duration> {
        (self.auto_interval_secs > 0).then(|| Duration::from_secs(self.auto_interval_secs))
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }
}

/// Retry policy for idempotent sandbox commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Grace window between a leave signal and the kill
    #[serde(default = "default_kill_delay_secs")]
    pub kill_delay_secs: u64,

    /// How long a tab may stay hidden before shutdown starts
    #[serde(default = "default_tab_hidden_secs")]
    pub tab_hidden_secs: u64,

    /// Re-check interval while generation is streaming
    #[serde(default = "default_streaming_recheck_secs")]
    pub streaming_recheck_secs: u64,

    /// Lease granted when shutdown is scheduled
    #[serde(default = "default_shutdown_lease_secs")]
    pub lease_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            kill_delay_secs: default_kill_delay_secs(),
            tab_hidden_secs: default_tab_hidden_secs(),
            streaming_recheck_secs: default_streaming_recheck_secs(),
            lease_secs: default_shutdown_lease_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How long to wait for the dev server to answer (0 = don't wait)
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_health_timeout_secs(),
            interval_ms: default_health_interval_ms(),
        }
    }
}

/// Commands run in the project dir of every freshly created sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Dependency install, after restore
    #[serde(default = "default_install_command")]
    pub command: Option<String>,

    /// Long-running service, started in the background after install
    #[serde(default)]
    pub start_command: Option<String>,

    #[serde(default = "default_install_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: default_install_command(),
            start_command: None,
            timeout_secs: default_install_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Host file recording which projects have backups
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

// Default value functions
fn default_provider() -> String {
    "docker".to_string()
}

fn default_template() -> String {
    "sandvault-node:latest".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_lease_secs() -> u64 {
    15 * 60
}

fn default_project_dir() -> String {
    "/home/user/project".to_string()
}

fn default_state_dir() -> String {
    ".sandvault".to_string()
}

fn default_memory() -> String {
    "4g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_bucket() -> String {
    "sandvault-projects".to_string()
}

fn default_endpoint() -> String {
    "https://s3.amazonaws.com".to_string()
}

fn default_mount_point() -> String {
    "/mnt/sandvault".to_string()
}

fn default_credentials_file() -> String {
    "/etc/passwd-s3fs".to_string()
}

fn default_access_key_env() -> String {
    "SANDVAULT_STORE_ACCESS_KEY".to_string()
}

fn default_secret_key_env() -> String {
    "SANDVAULT_STORE_SECRET_KEY".to_string()
}

fn default_mount_command() -> String {
    "s3fs {bucket} {mount_point} -o passwd_file={credentials_file} -o url={endpoint} \
     -o use_path_request_style -o allow_other -o nonempty"
        .to_string()
}

fn default_probe_command() -> String {
    "mountpoint -q {mount_point}".to_string()
}

fn default_unmount_command() -> String {
    "fusermount -uz {mount_point} || umount -l {mount_point}".to_string()
}

fn default_local_root() -> String {
    ".sandvault/store".to_string()
}

fn default_exclude_dirs() -> Vec<String> {
    [
        "node_modules",
        ".next",
        ".nuxt",
        ".turbo",
        ".cache",
        ".vercel",
        "dist",
        "build",
        "out",
        "coverage",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_exclude_files() -> Vec<String> {
    [
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "bun.lockb",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_auto_interval_secs() -> u64 {
    5 * 60
}

fn default_wait_secs() -> u64 {
    120
}

fn default_wait_poll_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_kill_delay_secs() -> u64 {
    60
}

fn default_tab_hidden_secs() -> u64 {
    3 * 60
}

fn default_streaming_recheck_secs() -> u64 {
    30
}

fn default_shutdown_lease_secs() -> u64 {
    10 * 60
}

fn default_health_timeout_secs() -> u64 {
    60
}

fn default_health_interval_ms() -> u64 {
    1000
}

#[allow(clippy::unnecessary_wraps)] // serde default must match the field type
fn default_install_command() -> Option<String> {
    Some("if [ -f package.json ]; then npm install --no-audit --no-fund; fi".to_string())
}

fn default_install_timeout_secs() -> u64 {
    10 * 60
}

fn default_metadata_path() -> String {
    ".sandvault/projects.toml".to_string()
}

impl Config {
    /// Load configuration from `sandvault.toml` in `dir`, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_from(&dir.join(CONFIG_FILE))
    }

    /// Load configuration from an explicit file, using defaults if not found
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            debug!("No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Resolves the sandbox provider to use.
    /// Priority: CLI flag > `SANDVAULT_PROVIDER` env var > config file.
    pub fn resolve_provider(&self, provider_override: Option<&str>) -> Result<ProviderKind> {
        let env_provider = std::env::var(PROVIDER_ENV).ok();
        self.resolve_provider_with_env(provider_override, env_provider.as_deref())
    }

    /// Internal helper for provider resolution with explicit env var value.
    /// Enables testing without modifying actual environment.
    fn resolve_provider_with_env(
        &self,
        provider_override: Option<&str>,
        env_provider: Option<&str>,
    ) -> Result<ProviderKind> {
        if let Some(p) = provider_override {
            debug!("Using CLI provider override: {}", p);
            return p.parse();
        }

        if let Some(env_val) = env_provider {
            if !env_val.is_empty() {
                debug!("Using {} env var: {}", PROVIDER_ENV, env_val);
                return env_val.parse();
            }
        }

        self.sandbox.get_provider()
    }
}

/// Expand ~ to home directory
pub(crate) fn expand_path(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest))
    } else {
        Ok(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sandbox.provider, "docker");
        assert_eq!(config.shutdown.kill_delay_secs, 60);
        assert_eq!(config.shutdown.tab_hidden_secs, 180);
        assert_eq!(config.shutdown.streaming_recheck_secs, 30);
        assert_eq!(config.backup.wait_secs, 120);
        assert!(config
            .backup
            .exclude_dirs
            .contains(&"node_modules".to_string()));
        assert!(config
            .backup
            .exclude_files
            .contains(&"package-lock.json".to_string()));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sandbox]
provider = "local"
template = "node:20"
port = 5173

[store]
bucket = "my-bucket"
mount_point = "/mnt/store"

[backup]
exclude_dirs = ["node_modules"]
auto_interval_secs = 0

[shutdown]
kill_delay_secs = 10
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sandbox.get_provider().unwrap(), ProviderKind::Local);
        assert_eq!(config.sandbox.port, 5173);
        assert_eq!(config.store.bucket, "my-bucket");
        assert_eq!(config.store.mount_point, "/mnt/store");
        assert_eq!(config.backup.exclude_dirs, vec!["node_modules"]);
        assert!(config.backup.auto_interval().is_none());
        assert_eq!(config.shutdown.kill_delay_secs, 10);
        // Untouched sections keep their defaults
        assert_eq!(config.shutdown.tab_hidden_secs, 180);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.template, "sandvault-node:latest");
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[sandbox\nport = ").unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_resolve_provider_precedence() {
        let config = Config::default();
        assert_eq!(
            config.resolve_provider_with_env(None, None).unwrap(),
            ProviderKind::Docker
        );
        assert_eq!(
            config.resolve_provider_with_env(None, Some("local")).unwrap(),
            ProviderKind::Local
        );
        assert_eq!(
            config
                .resolve_provider_with_env(Some("docker"), Some("local"))
                .unwrap(),
            ProviderKind::Docker
        );
        assert_eq!(
            config.resolve_provider_with_env(None, Some("")).unwrap(),
            ProviderKind::Docker
        );
        assert!(config.resolve_provider_with_env(None, Some("vm")).is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = StoreCredentials {
            access_key: "AKIA".to_string(),
            secret_key: "hunter2".to_string(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("AKIA"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/var/lib").unwrap(), PathBuf::from("/var/lib"));
        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/.sandvault").unwrap();
            assert!(!expanded.starts_with("~"));
            assert!(expanded.ends_with(".sandvault"));
        }
    }
}

//! Retrying command execution against a sandbox.
//!
//! The command channel into a sandbox drops connections and times out
//! often enough that a single failure says very little. Everything run
//! through here must be idempotent: it may execute more than once.

use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::sandbox::{CommandOptions, CommandOutput, Sandbox, SandboxError};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (0-based); zero for the first.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.base_delay * (1u32 << (attempt - 1).min(16))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

/// Runs idempotent commands with retries.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandRunner {
    policy: RetryPolicy,
}

impl CommandRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `command`, retrying transient transport errors.
    ///
    /// A non-zero exit is returned as-is. An unreachable sandbox is
    /// returned immediately; retrying a dead sandbox only wastes time.
    pub async fn run(
        &self,
        sandbox: &dyn Sandbox,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutput, SandboxError> {
        self.retry(sandbox, command, options, false).await
    }

    /// Like [`run`](Self::run), but a non-zero exit also counts as a
    /// failed attempt. Returns the last output when attempts run out.
    pub async fn run_until_success(
        &self,
        sandbox: &dyn Sandbox,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutput, SandboxError> {
        self.retry(sandbox, command, options, true).await
    }

    /// Runs a test-style command and reports whether it exited 0.
    pub async fn check(
        &self,
        sandbox: &dyn Sandbox,
        command: &str,
        options: &CommandOptions,
    ) -> Result<bool, SandboxError> {
        Ok(self.run(sandbox, command, options).await?.success())
    }

    async fn retry(
        &self,
        sandbox: &dyn Sandbox,
        command: &str,
        options: &CommandOptions,
        retry_on_exit: bool,
    ) -> Result<CommandOutput, SandboxError> {
        let mut last = None;

        for attempt in 0..self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!(
                    sandbox = sandbox.id(),
                    "Retry attempt {} after {:?}: {}",
                    attempt + 1,
                    delay,
                    command
                );
                tokio::time::sleep(delay).await;
            }

            match sandbox.run_command(command, options).await {
                Ok(output) if output.success() || !retry_on_exit => return Ok(output),
                Ok(output) => {
                    debug!(
                        sandbox = sandbox.id(),
                        exit_code = output.exit_code,
                        "Command failed: {}",
                        command
                    );
                    last = Some(Ok(output));
                }
                Err(e) if e.is_transient() => {
                    warn!(sandbox = sandbox.id(), "Transient error running command: {}", e);
                    last = Some(Err(e));
                }
                Err(e) => return Err(e),
            }
        }

        last.unwrap_or_else(|| Err(SandboxError::transport("no attempts made")))
    }
}

//! Failures reported by sandbox providers.
//!
//! Callers care about one split: a transient transport failure is worth
//! retrying, an unreachable sandbox means the session is gone for good.

use std::time::Duration;

/// Error returned by every `Sandbox` and `SandboxProvider` call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// The sandbox no longer exists or has expired.
    #[error("Sandbox {sandbox_id} is unreachable: {message}")]
    Unreachable { sandbox_id: String, message: String },

    /// The command channel to the sandbox failed in a way that may succeed on retry.
    #[error("Sandbox transport error: {message}")]
    Transport { message: String },

    /// A sandbox operation exceeded its deadline.
    #[error("Sandbox operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// The provider could not create a sandbox.
    #[error("Sandbox creation failed: {message}")]
    CreateFailed { message: String },

    /// A sandbox operation failed for a non-transient reason.
    #[error("Sandbox operation failed: {message}")]
    OperationFailed { message: String },
}

impl SandboxError {
    /// Creates an `Unreachable` error.
    pub fn unreachable(sandbox_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            sandbox_id: sandbox_id.into(),
            message: message.into(),
        }
    }

    /// Creates a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `CreateFailed` error.
    pub fn create_failed(message: impl Into<String>) -> Self {
        Self::CreateFailed {
            message: message.into(),
        }
    }

    /// Creates an `OperationFailed` error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    ///
    /// Timeouts count as transient: a slow command channel is not proof
    /// that the sandbox is gone.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Returns true if the sandbox is gone and its session should be reaped.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

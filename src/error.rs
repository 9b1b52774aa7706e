//! Errors surfaced by coordinator operations.
//!
//! Each variant has a stable [`code`](CoordinatorError::code) so that
//! callers on the other side of the control channel can branch on it
//! without parsing messages.

use crate::sandbox::SandboxError;

/// Errors returned by the lifecycle coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// No live session with this sandbox id.
    #[error("Sandbox {sandbox_id} not found")]
    NotFound { sandbox_id: String },

    /// The session has no project or user attached.
    #[error("Sandbox {sandbox_id} has no owning project")]
    MissingOwner { sandbox_id: String },

    /// Creating or preparing a sandbox for the project failed.
    #[error("Could not load project {project_id}: {message}")]
    LoadFailed { project_id: String, message: String },

    /// Generation is writing into the sandbox.
    #[error("Sandbox {sandbox_id} is streaming")]
    Streaming { sandbox_id: String },

    /// A live session exists for the project.
    #[error("Project {project_id} already has a live sandbox ({sandbox_id})")]
    ProjectActive {
        project_id: String,
        sandbox_id: String,
    },

    /// A path or identifier would escape its directory.
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The durable store or backup records could not be accessed.
    #[error("Store error: {message}")]
    Store { message: String },
}

impl CoordinatorError {
    pub fn not_found(sandbox_id: impl Into<String>) -> Self {
        Self::NotFound {
            sandbox_id: sandbox_id.into(),
        }
    }

    pub fn missing_owner(sandbox_id: impl Into<String>) -> Self {
        Self::MissingOwner {
            sandbox_id: sandbox_id.into(),
        }
    }

    pub fn load_failed(project_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadFailed {
            project_id: project_id.into(),
            message: message.into(),
        }
    }

    pub fn streaming(sandbox_id: impl Into<String>) -> Self {
        Self::Streaming {
            sandbox_id: sandbox_id.into(),
        }
    }

    pub fn project_active(project_id: impl Into<String>, sandbox_id: impl Into<String>) -> Self {
        Self::ProjectActive {
            project_id: project_id.into(),
            sandbox_id: sandbox_id.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath { path: path.into() }
    }

    /// Wraps an `anyhow` error from the store layer, keeping its context chain.
    pub fn store(err: &anyhow::Error) -> Self {
        Self::Store {
            message: format!("{err:#}"),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::MissingOwner { .. } => "missing_owner",
            Self::LoadFailed { .. } => "load_failed",
            Self::Streaming { .. } => "streaming",
            Self::ProjectActive { .. } => "project_active",
            Self::InvalidPath { .. } => "invalid_path",
            Self::Sandbox(_) => "sandbox",
            Self::Store { .. } => "store",
        }
    }

    #[cfg(test)]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

//! Live sessions and per-project creation locks.
//!
//! The registry is the only authority on whether a sandbox is alive as
//! far as the coordinator is concerned. It is guarded by a std mutex that
//! is only ever held for a few map operations, never across an `.await`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

use crate::error::CoordinatorError;
use crate::sandbox::Sandbox;

/// A project's binding to a live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxSession {
    pub sandbox_id: String,
    pub project_id: String,
    pub user_id: String,
    pub sandbox_url: String,
    pub created_at: DateTime<Utc>,
    pub is_streaming: bool,
    pub is_tab_hidden: bool,
    pub tab_hidden_since: Option<DateTime<Utc>>,
    pub is_backing_up: bool,
    pub is_shutting_down: bool,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_code_hash: Option<String>,
    /// A backup exists that was never fully copied into this sandbox.
    /// Until it is, backups must not delete from the store.
    pub restore_pending: bool,
}

impl SandboxSession {
    pub fn new(
        sandbox_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        sandbox_url: impl Into<String>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            sandbox_url: sandbox_url.into(),
            created_at: Utc::now(),
            is_streaming: false,
            is_tab_hidden: false,
            tab_hidden_since: None,
            is_backing_up: false,
            is_shutting_down: false,
            last_backup_at: None,
            last_code_hash: None,
            restore_pending: false,
        }
    }

    /// `(user_id, project_id)`, if both are set.
    pub fn owner(&self) -> Option<(&str, &str)> {
        if self.user_id.is_empty() || self.project_id.is_empty() {
            None
        } else {
            Some((&self.user_id, &self.project_id))
        }
    }
}

struct Entry {
    session: SandboxSession,
    sandbox: Arc<dyn Sandbox>,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, Entry>,
    /// project_id -> sandbox_id
    by_project: HashMap<String, String>,
}

/// Sessions keyed by sandbox id, with a secondary index by project.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    tables: Mutex<Tables>,
}

impl SessionRegistry {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session. Fails if the project already has one.
    pub fn insert(
        &self,
        session: SandboxSession,
        sandbox: Arc<dyn Sandbox>,
    ) -> Result<(), CoordinatorError> {
        let mut tables = self.lock();
        if let Some(existing) = tables.by_project.get(&session.project_id) {
            return Err(CoordinatorError::project_active(
                &session.project_id,
                existing,
            ));
        }
        tables
            .by_project
            .insert(session.project_id.clone(), session.sandbox_id.clone());
        tables
            .by_id
            .insert(session.sandbox_id.clone(), Entry { session, sandbox });
        Ok(())
    }

    pub fn get(&self, sandbox_id: &str) -> Option<SandboxSession> {
        self.lock().by_id.get(sandbox_id).map(|e| e.session.clone())
    }

    pub fn sandbox(&self, sandbox_id: &str) -> Option<Arc<dyn Sandbox>> {
        self.lock()
            .by_id
            .get(sandbox_id)
            .map(|e| Arc::clone(&e.sandbox))
    }

    pub fn entry(&self, sandbox_id: &str) -> Option<(SandboxSession, Arc<dyn Sandbox>)> {
        self.lock()
            .by_id
            .get(sandbox_id)
            .map(|e| (e.session.clone(), Arc::clone(&e.sandbox)))
    }

    pub fn find_by_project(&self, project_id: &str) -> Option<(SandboxSession, Arc<dyn Sandbox>)> {
        let tables = self.lock();
        let sandbox_id = tables.by_project.get(project_id)?;
        tables
            .by_id
            .get(sandbox_id)
            .map(|e| (e.session.clone(), Arc::clone(&e.sandbox)))
    }

    /// Mutates a session in place. `f` must not change the project id.
    pub fn update<R>(&self, sandbox_id: &str, f: impl FnOnce(&mut SandboxSession) -> R) -> Option<R> {
        self.lock()
            .by_id
            .get_mut(sandbox_id)
            .map(|e| f(&mut e.session))
    }

    pub fn remove(&self, sandbox_id: &str) -> Option<(SandboxSession, Arc<dyn Sandbox>)> {
        let mut tables = self.lock();
        let entry = tables.by_id.remove(sandbox_id)?;
        if tables.by_project.get(&entry.session.project_id).map(String::as_str) == Some(sandbox_id) {
            tables.by_project.remove(&entry.session.project_id);
        }
        Some((entry.session, entry.sandbox))
    }

    /// Snapshot of every session, ordered by sandbox id.
    pub fn sessions(&self) -> Vec<SandboxSession> {
        let mut sessions: Vec<_> = self
            .lock()
            .by_id
            .values()
            .map(|e| e.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        sessions
    }
}

/// Async mutual exclusion per project, held across sandbox creation.
///
/// Entries are created on first use and kept for the life of the process.
#[derive(Debug, Default)]
pub(crate) struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectLocks {
    /// Waits for the project's lock. Waiters are served in FIFO order.
    pub async fn acquire(&self, project_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(project_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

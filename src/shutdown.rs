//! Debounced "back up now, kill later" per sandbox.
//!
//! Two things start a shutdown: an explicit leave signal, and a tab that
//! stays hidden past a threshold. Either way the project is backed up
//! immediately and the kill is armed for after a grace window, during
//! which any sign of life cancels it.
//!
//! All timers for a sandbox live in one table behind one lock. Every
//! arming gets a fresh generation number, and a timer only acts if its
//! own generation is still in the table. It decides under that lock
//! whether to kill, which removes the entry, or to re-arm, which swaps
//! the generation in place. A cancel that wins the lock first therefore
//! guarantees the timer does nothing, and one that comes later still
//! finds the re-armed entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backup::SyncOutcome;
use crate::config::ShutdownConfig;
use crate::session::SandboxSession;
use crate::timer::DelayedTask;

/// Where a sandbox is in its shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Active,
    BackupRequested,
    BackupDone,
    BackupFailed,
    KillScheduled,
    Killed,
}

/// What the scheduler needs from whoever owns the sessions.
#[async_trait]
pub(crate) trait ShutdownHooks: Send + Sync + Sized + 'static {
    fn scheduler(&self) -> &ShutdownScheduler<Self>;

    /// Current session state, `None` once the session is gone.
    fn session(&self, sandbox_id: &str) -> Option<SandboxSession>;

    fn set_shutting_down(&self, sandbox_id: &str, shutting_down: bool);

    /// Best-effort backup, mount check included.
    async fn backup(&self, sandbox_id: &str) -> SyncOutcome;

    async fn extend_lease(&self, sandbox_id: &str, lease: Duration);

    /// Kills the sandbox and drops its session. Must tolerate a session
    /// that has already vanished.
    async fn kill(&self, sandbox_id: &str);
}

/// Scheduler delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShutdownTimings {
    pub kill_delay: Duration,
    pub tab_hidden: Duration,
    pub streaming_recheck: Duration,
    /// Lease granted when a shutdown is scheduled; must outlast the
    /// backup plus `kill_delay`.
    pub lease: Duration,
}

impl From<&ShutdownConfig> for ShutdownTimings {
    fn from(config: &ShutdownConfig) -> Self {
        Self {
            kill_delay: Duration::from_secs(config.kill_delay_secs),
            tab_hidden: Duration::from_secs(config.tab_hidden_secs),
            streaming_recheck: Duration::from_secs(config.streaming_recheck_secs),
            lease: Duration::from_secs(config.lease_secs),
        }
    }
}

/// A kill waiting for its grace window to pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingShutdown {
    pub project_id: String,
    pub user_id: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip)]
    pub kill_at: Instant,
}

struct ArmedKill {
    info: PendingShutdown,
    task: DelayedTask,
}

/// Shutdown state for one sandbox. Exists from the moment a shutdown is
/// requested, before the backup runs, so a cancel during the backup
/// stops the kill from being armed at all.
struct ShutdownSlot {
    generation: u64,
    armed: Option<ArmedKill>,
}

struct HiddenWatch {
    generation: u64,
    task: DelayedTask,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    shutdowns: HashMap<String, ShutdownSlot>,
    hidden: HashMap<String, HiddenWatch>,
    phases: HashMap<String, ShutdownPhase>,
}

impl Timers {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Schedules and cancels delayed shutdowns.
pub(crate) struct ShutdownScheduler<H: ShutdownHooks> {
    hooks: Weak<H>,
    timings: ShutdownTimings,
    timers: Mutex<Timers>,
}

impl<H: ShutdownHooks> ShutdownScheduler<H> {
    pub fn new(hooks: Weak<H>, timings: ShutdownTimings) -> Self {
        Self {
            hooks,
            timings,
            timers: Mutex::new(Timers::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Backs the sandbox up now and arms its kill after the grace window.
    ///
    /// Replaces any shutdown already pending. Returns whether a kill was
    /// armed; it is not if the session disappeared or the request was
    /// cancelled while the backup ran.
    pub async fn schedule_shutdown(&self, sandbox_id: &str, project_id: &str, user_id: &str) -> bool {
        let Some(hooks) = self.hooks.upgrade() else {
            return false;
        };
        if hooks.session(sandbox_id).is_none() {
            debug!(sandbox = sandbox_id, "No session, nothing to shut down");
            return false;
        }

        let generation = {
            let mut timers = self.lock();
            let generation = timers.next_generation();
            let previous = timers.shutdowns.insert(
                sandbox_id.to_string(),
                ShutdownSlot {
                    generation,
                    armed: None,
                },
            );
            if let Some(armed) = previous.and_then(|slot| slot.armed) {
                armed.task.cancel();
                debug!(sandbox = sandbox_id, "Replaced pending shutdown");
            }
            timers
                .phases
                .insert(sandbox_id.to_string(), ShutdownPhase::BackupRequested);
            generation
        };

        let outcome = hooks.backup(sandbox_id).await;
        if outcome == SyncOutcome::Unreachable {
            warn!(sandbox = sandbox_id, "Sandbox unreachable during shutdown backup, reaping");
            if self.claim_shutdown(sandbox_id, generation) {
                self.set_phase(sandbox_id, ShutdownPhase::Killed);
                hooks.kill(sandbox_id).await;
            }
            return false;
        }

        {
            let mut timers = self.lock();
            if !timers
                .shutdowns
                .get(sandbox_id)
                .is_some_and(|slot| slot.generation == generation)
            {
                debug!(sandbox = sandbox_id, "Shutdown cancelled during backup");
                return false;
            }
            let phase = if outcome.is_success() {
                ShutdownPhase::BackupDone
            } else {
                ShutdownPhase::BackupFailed
            };
            debug!(sandbox = sandbox_id, ?phase, "Shutdown phase");
            timers.phases.insert(sandbox_id.to_string(), phase);
        }

        hooks.extend_lease(sandbox_id, self.timings.lease).await;

        self.arm_kill(sandbox_id, project_id, user_id, generation, self.timings.kill_delay)
    }

    /// Arms the kill for the shutdown identified by `generation`, unless it
    /// was cancelled or superseded.
    fn arm_kill(
        &self,
        sandbox_id: &str,
        project_id: &str,
        user_id: &str,
        generation: u64,
        delay: Duration,
    ) -> bool {
        let Some(hooks) = self.hooks.upgrade() else {
            return false;
        };

        {
            let mut timers = self.lock();
            let Some(slot) = timers
                .shutdowns
                .get_mut(sandbox_id)
                .filter(|slot| slot.generation == generation)
            else {
                debug!(sandbox = sandbox_id, "Shutdown cancelled before kill was armed");
                return false;
            };

            let task = self.spawn_kill(sandbox_id, generation, delay);
            slot.armed = Some(ArmedKill {
                info: PendingShutdown {
                    project_id: project_id.to_string(),
                    user_id: user_id.to_string(),
                    scheduled_at: Utc::now(),
                    kill_at: Instant::now() + delay,
                },
                task,
            });
            timers
                .phases
                .insert(sandbox_id.to_string(), ShutdownPhase::KillScheduled);
        }

        hooks.set_shutting_down(sandbox_id, true);
        info!(sandbox = sandbox_id, project = project_id, "Kill scheduled in {:?}", delay);
        true
    }

    fn spawn_kill(&self, sandbox_id: &str, generation: u64, delay: Duration) -> DelayedTask {
        let id = sandbox_id.to_string();
        let weak = self.hooks.clone();
        DelayedTask::spawn(delay, async move {
            if let Some(hooks) = weak.upgrade() {
                hooks.scheduler().fire_kill(&id, generation).await;
            }
        })
    }

    /// Removes the shutdown entry if it still belongs to `generation`.
    fn claim_shutdown(&self, sandbox_id: &str, generation: u64) -> bool {
        let mut timers = self.lock();
        if timers
            .shutdowns
            .get(sandbox_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            timers.shutdowns.remove(sandbox_id);
            true
        } else {
            false
        }
    }

    async fn fire_kill(&self, sandbox_id: &str, generation: u64) {
        let Some(hooks) = self.hooks.upgrade() else {
            return;
        };

        // Decided under one lock so a concurrent cancel either removes the
        // slot first or finds it re-armed, never missing.
        let pending = {
            let mut timers = self.lock();
            if !timers
                .shutdowns
                .get(sandbox_id)
                .is_some_and(|slot| slot.generation == generation)
            {
                debug!(sandbox = sandbox_id, "Stale kill timer ignored");
                return;
            }

            let Some(session) = hooks.session(sandbox_id) else {
                debug!(sandbox = sandbox_id, "Session already gone at kill time");
                timers.shutdowns.remove(sandbox_id);
                if let Some(watch) = timers.hidden.remove(sandbox_id) {
                    watch.task.cancel();
                }
                timers.phases.remove(sandbox_id);
                return;
            };

            if session.is_streaming {
                let generation = timers.next_generation();
                let delay = self.timings.streaming_recheck;
                let task = self.spawn_kill(sandbox_id, generation, delay);
                if let Some(slot) = timers.shutdowns.get_mut(sandbox_id) {
                    slot.generation = generation;
                    if let Some(armed) = slot.armed.as_mut() {
                        armed.info.kill_at = Instant::now() + delay;
                        // Dropping the old handle leaves this task running
                        armed.task = task;
                    }
                }
                info!(
                    sandbox = sandbox_id,
                    "Generation still streaming, rechecking in {:?}", delay
                );
                return;
            }

            let Some(armed) = timers.shutdowns.remove(sandbox_id).and_then(|slot| slot.armed)
            else {
                return;
            };
            if let Some(watch) = timers.hidden.remove(sandbox_id) {
                watch.task.cancel();
            }
            timers
                .phases
                .insert(sandbox_id.to_string(), ShutdownPhase::Killed);
            armed.info
        };

        info!(sandbox = sandbox_id, project = %pending.project_id, "Grace window over, killing sandbox");
        hooks.kill(sandbox_id).await;
    }

    /// Cancels a pending or in-flight shutdown. Returns whether there was
    /// one. A backup that already ran is not undone.
    pub fn cancel_pending_shutdown(&self, sandbox_id: &str) -> bool {
        let removed = {
            let mut timers = self.lock();
            let removed = timers.shutdowns.remove(sandbox_id);
            if removed.is_some() {
                timers.phases.remove(sandbox_id);
            }
            removed
        };
        let Some(slot) = removed else {
            return false;
        };

        if let Some(armed) = slot.armed {
            armed.task.cancel();
        }
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.set_shutting_down(sandbox_id, false);
        }
        info!(sandbox = sandbox_id, "Pending shutdown cancelled");
        true
    }

    pub fn pending(&self, sandbox_id: &str) -> Option<PendingShutdown> {
        self.lock()
            .shutdowns
            .get(sandbox_id)
            .and_then(|slot| slot.armed.as_ref())
            .map(|armed| armed.info.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .shutdowns
            .values()
            .filter(|slot| slot.armed.is_some())
            .count()
    }

    /// Phase of the sandbox's shutdown sequence. `Killed` is remembered
    /// until [`forget`](Self::forget).
    pub fn phase(&self, sandbox_id: &str) -> ShutdownPhase {
        self.lock()
            .phases
            .get(sandbox_id)
            .copied()
            .unwrap_or(ShutdownPhase::Active)
    }

    fn set_phase(&self, sandbox_id: &str, phase: ShutdownPhase) {
        debug!(sandbox = sandbox_id, ?phase, "Shutdown phase");
        self.lock().phases.insert(sandbox_id.to_string(), phase);
    }

    /// Starts the hidden-tab watch. A watch already running keeps its
    /// original deadline.
    pub fn tab_hidden(&self, sandbox_id: &str) {
        let mut timers = self.lock();
        if timers.hidden.contains_key(sandbox_id) {
            return;
        }
        let generation = timers.next_generation();
        let task = self.spawn_hidden_check(sandbox_id, generation, self.timings.tab_hidden);
        timers
            .hidden
            .insert(sandbox_id.to_string(), HiddenWatch { generation, task });
        debug!(sandbox = sandbox_id, "Tab hidden, checking in {:?}", self.timings.tab_hidden);
    }

    /// Stops the hidden-tab watch. Returns whether one was running.
    pub fn tab_visible(&self, sandbox_id: &str) -> bool {
        match self.lock().hidden.remove(sandbox_id) {
            Some(watch) => {
                watch.task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_watching_hidden(&self, sandbox_id: &str) -> bool {
        self.lock().hidden.contains_key(sandbox_id)
    }

    fn spawn_hidden_check(&self, sandbox_id: &str, generation: u64, delay: Duration) -> DelayedTask {
        let id = sandbox_id.to_string();
        let weak = self.hooks.clone();
        DelayedTask::spawn(delay, async move {
            if let Some(hooks) = weak.upgrade() {
                hooks.scheduler().fire_hidden(&id, generation).await;
            }
        })
    }

    async fn fire_hidden(&self, sandbox_id: &str, generation: u64) {
        let Some(hooks) = self.hooks.upgrade() else {
            return;
        };

        let session = {
            let mut timers = self.lock();
            if !timers
                .hidden
                .get(sandbox_id)
                .is_some_and(|watch| watch.generation == generation)
            {
                return;
            }
            let session = hooks.session(sandbox_id);
            match &session {
                Some(session) if session.is_tab_hidden && session.is_streaming => {
                    debug!(sandbox = sandbox_id, "Hidden but streaming, rechecking later");
                    let generation = timers.next_generation();
                    let task =
                        self.spawn_hidden_check(sandbox_id, generation, self.timings.streaming_recheck);
                    timers
                        .hidden
                        .insert(sandbox_id.to_string(), HiddenWatch { generation, task });
                    return;
                }
                _ => {
                    timers.hidden.remove(sandbox_id);
                }
            }
            session
        };

        let Some(session) = session else {
            return;
        };
        if !session.is_tab_hidden {
            debug!(sandbox = sandbox_id, "Tab visible again, no shutdown");
            return;
        }
        let Some((user_id, project_id)) = session.owner() else {
            warn!(sandbox = sandbox_id, "Hidden session has no owner, not shutting down");
            return;
        };
        info!(sandbox = sandbox_id, "Tab hidden past threshold, starting shutdown");
        self.schedule_shutdown(sandbox_id, project_id, user_id).await;
    }

    /// Drops every timer and phase for the sandbox.
    pub fn forget(&self, sandbox_id: &str) {
        let mut timers = self.lock();
        if let Some(armed) = timers
            .shutdowns
            .remove(sandbox_id)
            .and_then(|slot| slot.armed)
        {
            armed.task.cancel();
        }
        if let Some(watch) = timers.hidden.remove(sandbox_id) {
            watch.task.cancel();
        }
        timers.phases.remove(sandbox_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::SyncStatus;
    use std::sync::Arc;

    /// Session table and event log standing in for the coordinator.
    struct FakeHooks {
        scheduler: ShutdownScheduler<FakeHooks>,
        sessions: Mutex<HashMap<String, SandboxSession>>,
        events: Mutex<Vec<String>>,
        backup_time: Duration,
        outcome: Mutex<SyncOutcome>,
    }

    impl FakeHooks {
        fn new(backup_time: Duration) -> Arc<Self> {
            let timings = ShutdownTimings {
                kill_delay: Duration::from_secs(60),
                tab_hidden: Duration::from_secs(180),
                streaming_recheck: Duration::from_secs(30),
                lease: Duration::from_secs(600),
            };
            let hooks = Arc::new_cyclic(|weak| Self {
                scheduler: ShutdownScheduler::new(weak.clone(), timings),
                sessions: Mutex::new(HashMap::new()),
                events: Mutex::new(Vec::new()),
                backup_time,
                outcome: Mutex::new(SyncOutcome::Synced {
                    at: Utc::now(),
                    status: SyncStatus::Complete,
                }),
            });
            hooks.add("sbx-1");
            hooks
        }

        fn add(&self, id: &str) {
            self.sessions.lock().unwrap().insert(
                id.to_string(),
                SandboxSession::new(id, "p1", "alice", "http://sbx.test"),
            );
        }

        fn edit(&self, id: &str, f: impl FnOnce(&mut SandboxSession)) {
            f(self.sessions.lock().unwrap().get_mut(id).unwrap());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, event: &str) -> usize {
            self.events().iter().filter(|e| *e == event).count()
        }

        fn record(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    #[async_trait]
    impl ShutdownHooks for FakeHooks {
        fn scheduler(&self) -> &ShutdownScheduler<Self> {
            &self.scheduler
        }

        fn session(&self, sandbox_id: &str) -> Option<SandboxSession> {
            self.sessions.lock().unwrap().get(sandbox_id).cloned()
        }

        fn set_shutting_down(&self, sandbox_id: &str, shutting_down: bool) {
            if let Some(s) = self.sessions.lock().unwrap().get_mut(sandbox_id) {
                s.is_shutting_down = shutting_down;
            }
        }

        async fn backup(&self, _sandbox_id: &str) -> SyncOutcome {
            self.record("backup");
            tokio::time::sleep(self.backup_time).await;
            self.outcome.lock().unwrap().clone()
        }

        async fn extend_lease(&self, _sandbox_id: &str, lease: Duration) {
            self.record(&format!("lease {}", lease.as_secs()));
        }

        async fn kill(&self, sandbox_id: &str) {
            self.record("kill");
            self.sessions.lock().unwrap().remove(sandbox_id);
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_then_lease_then_kill() {
        let hooks = FakeHooks::new(Duration::ZERO);
        assert!(hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await);
        assert_eq!(hooks.scheduler.phase("sbx-1"), ShutdownPhase::KillScheduled);
        assert!(hooks.session("sbx-1").unwrap().is_shutting_down);

        advance(59).await;
        assert_eq!(hooks.count("kill"), 0);

        advance(2).await;
        assert_eq!(hooks.events(), vec!["backup", "lease 600", "kill"]);
        assert_eq!(hooks.scheduler.phase("sbx-1"), ShutdownPhase::Killed);
        assert!(hooks.scheduler.pending("sbx-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_fire_never_kills() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await;

        advance(10).await;
        assert!(hooks.scheduler.cancel_pending_shutdown("sbx-1"));
        assert!(!hooks.scheduler.cancel_pending_shutdown("sbx-1"));
        assert!(!hooks.session("sbx-1").unwrap().is_shutting_down);
        assert_eq!(hooks.scheduler.phase("sbx-1"), ShutdownPhase::Active);

        advance(120).await;
        assert_eq!(hooks.count("kill"), 0);
        // The backup that already ran stays done
        assert_eq!(hooks.count("backup"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backup_prevents_arming() {
        let hooks = FakeHooks::new(Duration::from_secs(20));
        let scheduling = {
            let hooks = Arc::clone(&hooks);
            tokio::spawn(async move { hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await })
        };

        advance(5).await;
        assert!(hooks.scheduler.cancel_pending_shutdown("sbx-1"));
        assert!(!scheduling.await.unwrap());

        advance(120).await;
        assert_eq!(hooks.count("kill"), 0);
        assert_eq!(hooks.scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_keeps_one_pending_with_latest_time() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await;
        let first = hooks.scheduler.pending("sbx-1").unwrap();

        advance(30).await;
        hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await;
        let second = hooks.scheduler.pending("sbx-1").unwrap();
        assert_eq!(hooks.scheduler.pending_count(), 1);
        assert!(second.kill_at > first.kill_at);

        // The first arming would have fired at t=60
        advance(40).await;
        assert_eq!(hooks.count("kill"), 0);

        advance(25).await;
        assert_eq!(hooks.count("kill"), 1);
        assert_eq!(hooks.count("backup"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_defers_kill() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await;
        hooks.edit("sbx-1", |s| s.is_streaming = true);

        advance(61).await;
        assert_eq!(hooks.count("kill"), 0);
        assert!(hooks.scheduler.pending("sbx-1").is_some());

        advance(30).await;
        assert_eq!(hooks.count("kill"), 0);

        hooks.edit("sbx-1", |s| s.is_streaming = false);
        advance(30).await;
        assert_eq!(hooks.count("kill"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_rearm_stays_cancellable() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await;
        let first = hooks.scheduler.pending("sbx-1").unwrap();
        hooks.edit("sbx-1", |s| s.is_streaming = true);

        advance(61).await;
        let rearmed = hooks.scheduler.pending("sbx-1").unwrap();
        assert_eq!(rearmed.scheduled_at, first.scheduled_at);
        assert!(rearmed.kill_at > first.kill_at);
        assert_eq!(hooks.scheduler.phase("sbx-1"), ShutdownPhase::KillScheduled);

        assert!(hooks.scheduler.cancel_pending_shutdown("sbx-1"));
        hooks.edit("sbx-1", |s| s.is_streaming = false);
        advance(120).await;
        assert_eq!(hooks.count("kill"), 0);
        assert_eq!(hooks.scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_of_vanished_session_is_noop() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await;
        hooks.sessions.lock().unwrap().clear();

        advance(61).await;
        assert_eq!(hooks.count("kill"), 0);
        assert_eq!(hooks.scheduler.phase("sbx-1"), ShutdownPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_backup_still_kills() {
        let hooks = FakeHooks::new(Duration::ZERO);
        *hooks.outcome.lock().unwrap() = SyncOutcome::Failed {
            reason: "mount down".to_string(),
        };
        hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await;

        advance(61).await;
        assert_eq!(hooks.count("kill"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backup_reaps_immediately() {
        let hooks = FakeHooks::new(Duration::ZERO);
        *hooks.outcome.lock().unwrap() = SyncOutcome::Unreachable;

        assert!(!hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await);
        assert_eq!(hooks.events(), vec!["backup", "kill"]);
        assert_eq!(hooks.scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_tab_starts_shutdown() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.edit("sbx-1", |s| s.is_tab_hidden = true);
        hooks.scheduler.tab_hidden("sbx-1");

        advance(179).await;
        assert_eq!(hooks.count("backup"), 0);

        advance(2).await;
        assert_eq!(hooks.count("backup"), 1);
        assert!(hooks.scheduler.pending("sbx-1").is_some());
        assert!(!hooks.scheduler.is_watching_hidden("sbx-1"));

        advance(60).await;
        assert_eq!(hooks.count("kill"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_before_threshold_cancels_watch() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.edit("sbx-1", |s| s.is_tab_hidden = true);
        hooks.scheduler.tab_hidden("sbx-1");

        advance(100).await;
        hooks.edit("sbx-1", |s| s.is_tab_hidden = false);
        assert!(hooks.scheduler.tab_visible("sbx-1"));

        advance(300).await;
        assert!(hooks.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_protects_hidden_tab() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.edit("sbx-1", |s| {
            s.is_tab_hidden = true;
            s.is_streaming = true;
        });
        hooks.scheduler.tab_hidden("sbx-1");

        advance(181).await;
        assert_eq!(hooks.count("backup"), 0);
        assert!(hooks.scheduler.is_watching_hidden("sbx-1"));

        // Still streaming at the first recheck
        advance(30).await;
        assert_eq!(hooks.count("backup"), 0);

        hooks.edit("sbx-1", |s| s.is_streaming = false);
        advance(30).await;
        assert_eq!(hooks.count("backup"), 1);

        advance(60).await;
        assert_eq!(hooks.count("kill"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_hidden_keeps_first_deadline() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.edit("sbx-1", |s| s.is_tab_hidden = true);
        hooks.scheduler.tab_hidden("sbx-1");
        advance(100).await;
        hooks.scheduler.tab_hidden("sbx-1");

        advance(81).await;
        assert_eq!(hooks.count("backup"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_everything() {
        let hooks = FakeHooks::new(Duration::ZERO);
        hooks.edit("sbx-1", |s| s.is_tab_hidden = true);
        hooks.scheduler.schedule_shutdown("sbx-1", "p1", "alice").await;
        hooks.scheduler.tab_hidden("sbx-1");

        hooks.scheduler.forget("sbx-1");
        advance(600).await;
        assert_eq!(hooks.count("kill"), 0);
        assert_eq!(hooks.count("backup"), 1);
        assert_eq!(hooks.scheduler.phase("sbx-1"), ShutdownPhase::Active);
    }
}

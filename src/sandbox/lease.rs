//! Idle lease for providers that have no native sandbox timeout.
//!
//! Hosted sandbox services kill a sandbox whose timeout is not extended.
//! Docker containers and host directories have no such thing, so the
//! provider arms a watchdog that destroys the sandbox once the lease
//! deadline passes without an extension.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

/// A resettable deadline.
#[derive(Debug)]
pub(crate) struct Lease {
    deadline: Mutex<Instant>,
}

impl Lease {
    /// Starts a lease expiring `duration` from now.
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            deadline: Mutex::new(Instant::now() + duration),
        })
    }

    /// Moves the deadline to `duration` from now.
    pub fn extend(&self, duration: Duration) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now() + duration;
    }

    /// Current deadline.
    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a task that runs `on_expire` once the deadline passes.
    ///
    /// Extensions made while the watchdog sleeps are honoured: it re-reads
    /// the deadline on every wake-up.
    pub fn watch<F, Fut>(self: &Arc<Self>, label: String, on_expire: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lease = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = lease.deadline();
                tokio::time::sleep_until(deadline).await;
                if Instant::now() >= lease.deadline() {
                    break;
                }
            }
            info!(sandbox = %label, "Sandbox lease expired");
            on_expire().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_after_deadline() {
        let lease = Lease::new(Duration::from_secs(10));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _task = lease.watch("sbx".to_string(), move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_postpones_expiry() {
        let lease = Lease::new(Duration::from_secs(10));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _task = lease.watch("sbx".to_string(), move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(8)).await;
        lease.extend(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}

//! Cancellable delayed actions.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A future that runs once after a delay unless cancelled first.
///
/// Cancelling before the delay elapses guarantees the action never runs.
/// Cancelling after it has started aborts it at its next `.await`, so
/// actions that must not be torn mid-way should claim their work under a
/// lock before awaiting anything.
#[derive(Debug)]
pub(crate) struct DelayedTask {
    handle: JoinHandle<()>,
}

impl DelayedTask {
    pub fn spawn<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

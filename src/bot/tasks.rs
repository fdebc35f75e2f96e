//! Spawn-and-detach background work with visible failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Owns every detached task the server starts (webhook dispatch, manual job
/// triggers, scheduled runs) so errors are logged and shutdown can wait for
/// them.
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` in the background. An `Err` result or a panic is logged
    /// under `name`; cancellation on shutdown drops the future.
    pub fn spawn<F, E>(&self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let name = name.into();
        let cancel = self.cancel.clone();

        let inner = tokio::spawn(async move {
            tokio::select! {
                result = fut => result,
                _ = cancel.cancelled() => Ok(()),
            }
        });

        self.tracker.spawn(async move {
            match inner.await {
                Ok(Ok(())) => debug!("Task '{}' finished", name),
                Ok(Err(e)) => error!("Task '{}' failed: {}", name, e),
                Err(e) if e.is_panic() => error!("Task '{}' panicked", name),
                Err(e) => warn!("Task '{}' aborted: {}", name, e),
            }
        });
    }

    /// Wait up to `grace` for outstanding work, then cancel whatever is left.
    /// Cancelled futures are dropped, which kills any agent process they own.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Waiting for {} background task(s)", self.tracker.len());
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return;
        }
        warn!("Background tasks still running after {:?}, cancelling", grace);
        self.cancel.cancel();
        self.tracker.wait().await;
    }

    #[cfg(test)]
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every task spawned so far has finished.
    #[cfg(test)]
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Bounded pool for work that must not block the caller: secondary
/// propagation and event publishing.
///
/// Accepted tasks always run to completion; cancellation only stops the pool
/// from accepting new ones. Owned by startup and handed to the orchestrator.
#[derive(Clone)]
pub struct PropagationPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    max_concurrency: usize,
}

impl PropagationPool {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Tasks accepted and not yet finished, including those waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `task` once a permit is free. `None` once the pool is shut down.
    pub fn spawn<F>(&self, task: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            tracing::warn!("Propagation pool is shut down, task rejected");
            return None;
        }

        let permits = Arc::clone(&self.permits);
        Some(self.tracker.spawn(async move {
            // The semaphore is never closed, so acquire only fails if it were.
            let _permit = permits.acquire_owned().await.ok();
            task.await
        }))
    }

    /// Fire-and-forget variant of [`spawn`](Self::spawn).
    pub fn spawn_detached<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(task).is_some()
    }

    /// Wait until every accepted task has finished. The pool stays open.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        if !self.shutdown.is_cancelled() {
            self.tracker.reopen();
        }
    }

    /// Stop accepting work and wait up to `grace` for in-flight tasks.
    ///
    /// Returns `false` if tasks were still running when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        let in_flight = self.tracker.len();
        tracing::info!(in_flight, "Draining propagation pool");

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("Propagation pool drained");
                true
            }
            Err(_) => {
                tracing::warn!(
                    remaining = self.tracker.len(),
                    "Propagation pool did not drain before the grace period"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for PropagationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationPool")
            .field("max_concurrency", &self.max_concurrency)
            .field("in_flight", &self.tracker.len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

//! Bounded worker pools.
//!
//! Two pools per engine session: one for locally-initiated friend tasks and
//! one bounding peer request handlers, so a flood of peer requests cannot
//! starve local push/pull work. Concurrency is capped by a semaphore;
//! shutdown is cooperative (close, cancel, await).

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run `work` once a pool slot frees up. The future is dropped unrun if
    /// the pool shuts down first.
    pub fn spawn<F>(&self, work: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let token = self.token.clone();
        let handle = self.tracker.spawn(async move {
            let permit = tokio::select! {
                _ = token.cancelled() => return,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let _permit = permit;
            work.await;
        });
        handle.abort_handle()
    }

    /// Reserve a pool slot for inline work (peer request handlers run on the
    /// server's connections but are bounded here). `None` once shut down.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        }
    }

    /// Graceful shutdown: refuse new work, cancel waiters, await in-flight
    /// tasks.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.token.cancel();
        self.tracker.wait().await;
    }
}

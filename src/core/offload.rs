// =============================================================================
// ThreadOffload — bounded worker pool for blocking broker-SDK calls
// =============================================================================
//
// The vendor SDK is synchronous; calling it on the cooperative scheduler
// would stall tick processing. Every blocking call goes through `submit`,
// which caps concurrency with a semaphore and runs the closure on the
// blocking pool. Must be started before the first broker call and stopped
// last on shutdown; submissions after `stop` are rejected.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error::EngineError;

/// Default number of concurrent blocking workers.
pub const DEFAULT_WORKERS: usize = 20;

pub struct ThreadOffload {
    permits: Arc<Semaphore>,
    stopped: AtomicBool,
    workers: usize,
}

impl ThreadOffload {
    pub fn new(workers: usize) -> Self {
        info!(workers, "thread offload pool initialised");
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            stopped: AtomicBool::new(false),
            workers,
        }
    }

    /// Run a blocking closure off the scheduler and await its result.
    ///
    /// Returns `EngineError::Shutdown` if the pool has been stopped.
    pub async fn submit<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)?;

        // Re-check after the (possibly long) permit wait.
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }

        let handle = tokio::task::spawn_blocking(move || {
            let out = f();
            drop(permit);
            out
        });

        handle.await.map_err(|e| {
            EngineError::TransientBroker(format!("offloaded call panicked: {e}"))
        })
    }

    /// Stop accepting submissions. In-flight closures run to completion.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.permits.close();
            debug!(workers = self.workers, "thread offload pool stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Default for ThreadOffload {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl std::fmt::Debug for ThreadOffload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadOffload")
            .field("workers", &self.workers)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_runs_closure_and_returns_value() {
        let pool = ThreadOffload::new(4);
        let out = pool.submit(|| 2 + 2).await.unwrap();
        assert_eq!(out, 4);
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let pool = ThreadOffload::new(4);
        pool.stop();
        let err = pool.submit(|| 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Shutdown));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        use std::sync::atomic::AtomicUsize;

        let pool = Arc::new(ThreadOffload::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}

//! Fixed-size pool for blocking capture and model calls.
//!
//! Work runs on tokio's blocking threads; the pool only bounds how many of
//! those calls are in flight at once, so one slow inference never stalls
//! request I/O.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info};

use vistalk_core::{Result, VistalkError};

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently running a job.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a worker and wait for its result.
    ///
    /// If the awaiting future is dropped the job still runs to completion
    /// and keeps its slot until then; its result is discarded.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VistalkError::Pool("worker pool is shut down".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| VistalkError::Pool(format!("worker job failed: {e}")))
    }

    /// Wait for in-flight jobs to finish, then refuse new ones.
    pub async fn shutdown(&self) {
        if self.permits.is_closed() {
            return;
        }
        debug!(in_flight = self.size - self.idle(), "Draining worker pool");
        if let Ok(all) = self.permits.acquire_many(self.size as u32).await {
            self.permits.close();
            drop(all);
        }
        info!("Worker pool stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_runs_job() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.run(|| 40 + 2).await.unwrap(), 42);
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn test_zero_size_means_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_then_rejects() {
        let pool = WorkerPool::new(1);
        let finished = Arc::new(AtomicUsize::new(0));

        let job_pool = pool.clone();
        let done = finished.clone();
        let job = tokio::spawn(async move {
            job_pool
                .run(move || {
                    std::thread::sleep(Duration::from_millis(50));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(pool.is_shut_down());
        assert!(job.await.unwrap().is_ok());
        assert!(matches!(pool.run(|| ()).await, Err(VistalkError::Pool(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_caller_keeps_slot_until_done() {
        let pool = WorkerPool::new(1);
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        let waiting = pool.run(move || {
            std::thread::sleep(Duration::from_millis(50));
            done.fetch_add(1, Ordering::SeqCst);
        });
        // Poll long enough to start the job, then abandon it
        let _ = tokio::time::timeout(Duration::from_millis(10), waiting).await;

        pool.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}

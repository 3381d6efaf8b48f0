//! Worker pool for offloaded request handlers.
//!
//! Workers share one job queue. Submitting returns as soon as the job is
//! queued; `shutdown` closes the queue and waits for queued jobs to finish.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{MetaError, Result};

/// Unit of work run by a worker.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fixed-size pool of async workers.
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawns `threads` workers sharing a queue of `queue_depth` jobs.
    pub fn new(threads: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let completed = Arc::new(AtomicU64::new(0));
        let workers = (0..threads.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let completed = Arc::clone(&completed);
                tokio::spawn(async move {
                    loop {
                        // Hold the queue lock only while waiting for the next job.
                        let job = receiver.lock().await.recv().await;
                        match job {
                            Some(job) => {
                                job.await;
                                completed.fetch_add(1, Ordering::Relaxed);
                            }
                            None => break,
                        }
                    }
                    debug!(worker, "worker exiting");
                })
            })
            .collect();
        Self {
            sender,
            workers,
            completed,
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(Box::pin(job))
            .await
            .map_err(|_| MetaError::Internal("worker pool closed".to_string()))
    }

    /// Closes the queue and waits for every queued job to finish.
    pub async fn shutdown(self) -> u64 {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker task failed");
            }
        }
        self.completed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run() {
        let pool = WorkerPool::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        assert_eq!(pool.shutdown().await, 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_workers_run_concurrently() {
        let pool = WorkerPool::new(4, 16);
        assert_eq!(pool.size(), 4);
        let (tx, mut rx) = mpsc::channel::<()>(4);
        let gate = Arc::new(tokio::sync::Barrier::new(4));
        for _ in 0..4 {
            let gate = gate.clone();
            let tx = tx.clone();
            pool.submit(async move {
                gate.wait().await;
                let _ = tx.send(()).await;
            })
            .await
            .unwrap();
        }
        drop(tx);
        let all = tokio::time::timeout(Duration::from_secs(5), async {
            let mut n = 0;
            while rx.recv().await.is_some() {
                n += 1;
            }
            n
        })
        .await
        .unwrap();
        assert_eq!(all, 4);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_threads_rounds_up() {
        let pool = WorkerPool::new(0, 0);
        assert_eq!(pool.size(), 1);
        pool.submit(async {}).await.unwrap();
        assert_eq!(pool.shutdown().await, 1);
    }
}

//! Fixed-size worker pools
//!
//! Work is submitted as futures onto an unbounded FIFO consumed by a fixed
//! number of tokio worker tasks. A [`JobGroup`] is a lightweight wait-set
//! bound to a pool: it tracks how many jobs were dispatched and lets the
//! caller await them all, surfacing the first error.
//!
//! Two independent pools are used at runtime (general jobs and directory
//! walks) so that a walk job dispatching child walks can never deadlock its
//! own pool.

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A fixed pool of worker tasks consuming an unbounded queue of jobs.
#[derive(Clone)]
pub struct JobPool {
    queue: mpsc::UnboundedSender<Job>,
}

impl JobPool {
    /// Start `workers` tasks consuming the pool queue. Must be called from
    /// within a tokio runtime.
    pub fn new(workers: usize) -> Self {
        let (queue, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    // Receive under the lock, run with it released so the
                    // other workers can pick up queued jobs.
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }

        Self { queue }
    }

    fn submit(&self, job: Job) {
        // Send only fails when all workers are gone, which means the
        // runtime is shutting down; the job is dropped with it.
        let _ = self.queue.send(job);
    }

    /// Create a wait-set bound to this pool.
    pub fn group(&self) -> JobGroup {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        JobGroup {
            pool: self.clone(),
            dispatched: AtomicUsize::new(0),
            results_tx,
            results_rx: Mutex::new(results_rx),
        }
    }
}

/// A set of jobs dispatched onto a [`JobPool`], awaited together.
///
/// A failing job does not cancel its siblings; all dispatched work drains
/// before [`JobGroup::finish`] returns, and only the first recorded error
/// surfaces.
pub struct JobGroup {
    pool: JobPool,
    dispatched: AtomicUsize,
    results_tx: mpsc::UnboundedSender<Result<()>>,
    results_rx: Mutex<mpsc::UnboundedReceiver<Result<()>>>,
}

impl JobGroup {
    /// Submit a job to the pool and add it to this group's wait-set.
    pub fn dispatch<F>(&self, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.dispatched.fetch_add(1, Ordering::AcqRel);
        let results = self.results_tx.clone();
        self.pool.submit(Box::pin(async move {
            let _ = results.send(job.await);
        }));
    }

    /// Block until every dispatched job has completed and return the first
    /// recorded error, if any.
    ///
    /// All dispatches must happen before `finish` is awaited.
    pub async fn finish(&self) -> Result<()> {
        let mut rx = self.results_rx.lock().await;
        let mut first_err = None;
        let mut completed = 0usize;

        while completed < self.dispatched.load(Ordering::Acquire) {
            match rx.recv().await {
                Some(result) => {
                    completed += 1;
                    if let Err(err) = result {
                        first_err.get_or_insert(err);
                    }
                }
                None => break,
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScourError;
    use std::sync::atomic::AtomicU64;

    #[tokio::test]
    async fn test_group_runs_all_jobs() {
        let pool = JobPool::new(4);
        let group = pool.group();
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            group.dispatch(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        group.finish().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_group_surfaces_error_after_draining() {
        let pool = JobPool::new(2);
        let group = pool.group();
        let completed = Arc::new(AtomicU64::new(0));

        for idx in 0..10 {
            let completed = Arc::clone(&completed);
            group.dispatch(async move {
                completed.fetch_add(1, Ordering::SeqCst);
                if idx % 3 == 0 {
                    Err(ScourError::Task(format!("job {idx} failed")))
                } else {
                    Ok(())
                }
            });
        }

        let err = group.finish().await.unwrap_err();
        assert!(matches!(err, ScourError::Task(_)));
        // siblings are not cancelled by a failing job
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_single_worker_is_serial() {
        let pool = JobPool::new(1);
        let group = pool.group();
        let active = Arc::new(AtomicU64::new(0));
        let max_active = Arc::new(AtomicU64::new(0));

        for _ in 0..20 {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            group.dispatch(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        group.finish().await.unwrap();
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_group_finishes() {
        let pool = JobPool::new(2);
        let group = pool.group();
        group.finish().await.unwrap();
    }
}

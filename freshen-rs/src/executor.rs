//! Provides a bounded executor which runs background prefetches.
//!
//! Being a simple actor, the executor consists of a bounded queue and a dispatcher task which
//! pulls jobs from the queue and runs them. The number of jobs running at the same time is
//! limited by the **worker budget**. If the queue is full, new jobs are rejected instead of piling
//! up. This way a degraded backend (which makes each refresh slow) cannot lead to an unbounded
//! number of pending refreshes.
//!
//! An executor can be cloned and shared by many caches, so that e.g. all credential providers of
//! an application share a common budget for background refreshes.
//!
//! Each job carries a **CancellationToken**. A job whose token has been cancelled before the job
//! was started, is discarded. Once started, a job always runs to completion.
//!
//! # Example
//! ```
//! # use freshen::executor::PrefetchExecutor;
//! # use tokio_util::sync::CancellationToken;
//! # use futures::FutureExt;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let executor = PrefetchExecutor::new("shared-prefetcher", 4).unwrap();
//!
//! let (tx, rx) = tokio::sync::oneshot::channel();
//! assert!(executor.submit(
//!     Box::new(move || async move { let _ = tx.send(42); }.boxed()),
//!     CancellationToken::new()
//! ));
//! assert_eq!(rx.await.unwrap(), 42);
//!
//! executor.shutdown(Duration::from_secs(1)).await;
//! assert!(executor.is_shutdown());
//! # }
//! ```
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::CacheError;
use crate::fmt::format_duration;

/// Describes a unit of background work.
///
/// The closure is only invoked once the job is actually started. Therefore everything it
/// captures is dropped without running if the job is discarded.
pub type PrefetchTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Determines how many jobs may wait in the queue per worker.
const QUEUE_CAPACITY_PER_WORKER: usize = 16;

struct Job {
    task: PrefetchTask,
    cancellation: CancellationToken,
}

struct Inner {
    name: String,
    workers: usize,
    queue: mpsc::Sender<Job>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Runs background prefetches with a bounded number of workers.
#[derive(Clone)]
pub struct PrefetchExecutor {
    inner: Arc<Inner>,
}

impl PrefetchExecutor {
    /// Creates a new executor which runs up to **workers** jobs at the same time.
    ///
    /// # Errors
    /// Fails if **workers** is zero or so large that its queue would exceed the capacity supported
    /// by tokio's channels.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime, as the dispatcher task is spawned right away.
    pub fn new(name: impl Into<String>, workers: usize) -> Result<Self, CacheError> {
        if workers == 0 {
            return Err(CacheError::InvalidConfiguration(
                "A prefetch executor requires at least one worker".to_owned(),
            ));
        }

        let name = name.into();
        let capacity = workers
            .checked_mul(QUEUE_CAPACITY_PER_WORKER)
            .filter(|capacity| *capacity <= Semaphore::MAX_PERMITS)
            .ok_or_else(|| {
                CacheError::InvalidConfiguration(format!(
                    "A worker budget of {} exceeds the supported maximum of {}",
                    workers,
                    Semaphore::MAX_PERMITS / QUEUE_CAPACITY_PER_WORKER
                ))
            })?;
        let (queue, jobs) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        dispatch(
            name.clone(),
            jobs,
            Arc::new(Semaphore::new(workers)),
            shutdown.clone(),
            tracker.clone(),
        );

        Ok(PrefetchExecutor {
            inner: Arc::new(Inner {
                name,
                workers,
                queue,
                shutdown,
                tracker,
            }),
        })
    }

    /// Creates an executor with one worker per CPU.
    pub fn with_default_workers(name: impl Into<String>) -> Self {
        // num_cpus never reports zero, so this cannot fail...
        let workers = num_cpus::get().max(1);
        match PrefetchExecutor::new(name, workers) {
            Ok(executor) => executor,
            Err(_) => unreachable!("At least one worker is always present"),
        }
    }

    /// Returns the name of this executor.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the maximal number of jobs which run at the same time.
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Returns the number of jobs which are currently running.
    pub fn active(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Determines if [shutdown](PrefetchExecutor::shutdown) has already been invoked.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Enqueues the given task.
    ///
    /// Returns **false** if the task was rejected, either because the executor has been shut
    /// down or because its queue is full. In this case the task is dropped immediately.
    pub fn submit(&self, task: PrefetchTask, cancellation: CancellationToken) -> bool {
        if self.is_shutdown() {
            return false;
        }

        match self.inner.queue.try_send(Job { task, cancellation }) {
            Ok(_) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!(
                    "The queue of prefetch executor {} is full - Rejecting the job.",
                    self.inner.name
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stops the executor.
    ///
    /// No more jobs are accepted, queued jobs are discarded and running jobs are awaited for at
    /// most **timeout**. Jobs which are still running after that are abandoned (they keep running
    /// in the background, but nobody waits for them anymore).
    ///
    /// Calling this more than once has no effect.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.is_shutdown() {
            return;
        }

        log::debug!("Stopping prefetch executor {}...", self.inner.name);
        self.inner.shutdown.cancel();
        let _ = self.inner.tracker.close();

        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            log::warn!(
                "Prefetch executor {} still has {} running job(s) after {} - Abandoning them.",
                self.inner.name,
                self.inner.tracker.len(),
                format_duration(timeout)
            );
        }
    }
}

/// Spawns the dispatcher which pulls jobs from the queue and runs them once a worker is free.
///
/// Note that the dispatcher doesn't keep the sender of the queue alive, so it terminates once
/// either the executor is shut down or once all handles to it have been dropped.
fn dispatch(
    name: String,
    mut jobs: mpsc::Receiver<Job>,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let _ = tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if shutdown.is_cancelled() {
                break;
            }

            if job.cancellation.is_cancelled() {
                log::debug!("Discarding a cancelled job in prefetch executor {}.", name);
                continue;
            }

            let _ = tracker.spawn(async move {
                (job.task)().await;
                std::mem::drop(permit);
            });
        }

        // Drop all jobs which are still queued, so that everything they captured is released...
        jobs.close();
        while jobs.try_recv().is_ok() {}

        log::debug!("Prefetch executor {} has stopped.", name);
    });
}

#[cfg(test)]
mod tests {
    use crate::executor::{PrefetchExecutor, PrefetchTask};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    fn counting_task(
        active: Arc<AtomicUsize>,
        max: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
    ) -> PrefetchTask {
        Box::new(move || {
            async move {
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = max.fetch_max(now_active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = active.fetch_sub(1, Ordering::SeqCst);
                let _ = done.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn worker_budget_is_enforced() {
        let executor = PrefetchExecutor::new("test", 2).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            assert!(executor.submit(
                counting_task(active.clone(), max.clone(), done.clone()),
                CancellationToken::new()
            ));
        }

        while done.load(Ordering::SeqCst) < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(max.load(Ordering::SeqCst), 2);
        assert_eq!(executor.workers(), 2);
    }

    #[tokio::test]
    async fn default_executors_use_one_worker_per_cpu() {
        let executor = PrefetchExecutor::with_default_workers("default");
        assert_eq!(executor.workers(), num_cpus::get());
        assert_eq!(executor.name(), "default");
        assert_eq!(executor.active(), 0);
    }

    #[tokio::test]
    async fn oversized_worker_budgets_are_rejected() {
        assert!(PrefetchExecutor::new("huge", usize::MAX / 4).is_err());
        assert!(PrefetchExecutor::new("huge", Semaphore::MAX_PERMITS + 1).is_err());
        assert!(PrefetchExecutor::new(
            "huge",
            Semaphore::MAX_PERMITS / super::QUEUE_CAPACITY_PER_WORKER + 1
        )
        .is_err());
    }

    #[tokio::test]
    async fn queued_jobs_are_not_started_after_shutdown() {
        let executor = PrefetchExecutor::new("test", 1).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        // Both jobs are queued before the dispatcher gets a chance to run, so shutting down
        // right away must discard both of them...
        for _ in 0..2 {
            assert!(executor.submit(
                counting_task(active.clone(), max.clone(), done.clone()),
                CancellationToken::new()
            ));
        }
        executor.shutdown(Duration::from_secs(1)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(max.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_jobs_are_discarded() {
        let executor = PrefetchExecutor::new("test", 1).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let cancellation = CancellationToken::new();
        assert!(executor.submit(
            counting_task(active.clone(), max.clone(), done.clone()),
            cancellation.clone()
        ));
        cancellation.cancel();

        // A job which is submitted afterwards still runs...
        assert!(executor.submit(
            counting_task(active.clone(), max.clone(), done.clone()),
            CancellationToken::new()
        ));

        while done.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_queues_reject_jobs() {
        let executor = PrefetchExecutor::new("test", 1).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        // As we never yield, the dispatcher doesn't get a chance to pull anything from the
        // queue...
        for _ in 0..super::QUEUE_CAPACITY_PER_WORKER {
            assert!(executor.submit(
                counting_task(active.clone(), max.clone(), done.clone()),
                CancellationToken::new()
            ));
        }
        assert!(!executor.submit(
            counting_task(active.clone(), max.clone(), done.clone()),
            CancellationToken::new()
        ));
    }

    #[tokio::test]
    async fn shutdown_awaits_running_jobs_and_rejects_new_ones() {
        let executor = PrefetchExecutor::new("test", 1).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        assert!(executor.submit(
            counting_task(active.clone(), max.clone(), done.clone()),
            CancellationToken::new()
        ));
        // Give the dispatcher a chance to start the job...
        while active.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        executor.shutdown(Duration::from_secs(5)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(executor.active(), 0);

        assert!(!executor.submit(
            counting_task(active, max, done),
            CancellationToken::new()
        ));

        // Shutting down twice is fine...
        executor.shutdown(Duration::from_secs(5)).await;
    }
}

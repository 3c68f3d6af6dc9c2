//! Decides whether and how a cache refreshes its value in the background.
//!
//! Once a value enters its prefetch window, the cache asks its [PrefetchStrategy] to run a
//! refresh without blocking the caller. Two strategies are provided:
//!
//! * [SynchronousOnly] never prefetches. Values are only refreshed once they are stale, in which
//!   case callers wait for the refresh. This is the simplest approach, but every caller which
//!   arrives once the value went stale pays the full refresh latency.
//! * [BackgroundPrefetch] runs prefetches on a bounded [PrefetchExecutor]. Each strategy instance
//!   permits only a single pending prefetch, so that many callers hitting the prefetch window at
//!   the same time result in a single job.
//!
//! Refresh operations may leave the prefetch instant of an envelope open. In this case the
//! cache asks the strategy for a [lead](PrefetchStrategy::prefetch_lead), which is the time before
//! the stale instant at which the prefetch window opens. [BackgroundPrefetch] picks a random lead
//! between its minimal and maximal lead for each envelope, so that many caches which were filled
//! at the same time don't all hit the backend at the same moment.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;
use crate::executor::PrefetchExecutor;
use crate::fmt::format_duration;

/// Determines how long closing a cache waits for a running background refresh by default.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Describes the background refresh which is handed to a strategy.
pub type RefreshTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Decides whether and how a refresh is started in the background.
#[async_trait]
pub trait PrefetchStrategy: Send + Sync {
    /// Determines if values within their prefetch window should trigger a background refresh.
    fn should_prefetch(&self) -> bool;

    /// Schedules the given refresh to run in the background.
    ///
    /// Implementations must make this idempotent: if a prefetch is already pending or running,
    /// the given task is simply dropped.
    fn prefetch(&self, task: RefreshTask);

    /// Returns the lead used to derive a prefetch instant for envelopes which don't specify one.
    ///
    /// Returning **None** means that such envelopes have no prefetch window.
    fn prefetch_lead(&self) -> Option<Duration>;

    /// Cancels all pending (not yet started) prefetches and rejects new ones.
    ///
    /// This must not block, as it is also invoked when a cache is dropped.
    fn cancel(&self);

    /// Cancels pending prefetches and releases all resources owned by this strategy.
    ///
    /// If the strategy owns its executor, it is shut down and running prefetches are awaited
    /// for a bounded amount of time.
    async fn shutdown(&self);
}

/// Never prefetches: stale values are refreshed while the caller waits.
#[derive(Debug, Default, Copy, Clone)]
pub struct SynchronousOnly;

#[async_trait]
impl PrefetchStrategy for SynchronousOnly {
    fn should_prefetch(&self) -> bool {
        false
    }

    fn prefetch(&self, _task: RefreshTask) {}

    fn prefetch_lead(&self) -> Option<Duration> {
        None
    }

    fn cancel(&self) {}

    async fn shutdown(&self) {}
}

/// Resets the "prefetch pending" flag once the job which set it is done or discarded.
struct PendingGuard(Arc<AtomicBool>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Refreshes values in the background once they enter their prefetch window.
///
/// # Examples
///
/// ```
/// # use freshen::strategy::{BackgroundPrefetch, PrefetchStrategy};
/// # use freshen::executor::PrefetchExecutor;
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() {
/// // A strategy with its own executor using two workers. Values without explicit prefetch
/// // instant are prefetched 1 to 5 minutes before they go stale...
/// let strategy = BackgroundPrefetch::new(Duration::from_secs(60), Duration::from_secs(300), 2)
///     .unwrap();
/// assert!(strategy.should_prefetch());
///
/// // An invalid lead range is rejected...
/// assert!(BackgroundPrefetch::new(Duration::from_secs(300), Duration::from_secs(60), 2).is_err());
///
/// // Several strategies (one per cache) can share an executor...
/// let executor = PrefetchExecutor::new("credentials", 4).unwrap();
/// let first = BackgroundPrefetch::with_executor(
///     Duration::from_secs(60),
///     Duration::from_secs(300),
///     executor.clone(),
/// )
/// .unwrap();
/// let second = BackgroundPrefetch::with_executor(
///     Duration::from_secs(60),
///     Duration::from_secs(300),
///     executor.clone(),
/// )
/// .unwrap();
///
/// // Shutting down a strategy only stops an executor which it owns...
/// first.shutdown().await;
/// assert!(!first.should_prefetch());
/// assert!(second.should_prefetch());
/// assert!(!executor.is_shutdown());
/// # }
/// ```
pub struct BackgroundPrefetch {
    min_prefetch_lead: Duration,
    max_prefetch_lead: Duration,
    executor: PrefetchExecutor,
    owns_executor: bool,
    close_timeout: Duration,
    pending: Arc<AtomicBool>,
    cancellation: CancellationToken,
}

impl BackgroundPrefetch {
    /// Creates a strategy which owns an executor with the given worker budget.
    ///
    /// # Errors
    /// Fails if **min_prefetch_lead** exceeds **max_prefetch_lead** or if **workers** is zero.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    pub fn new(
        min_prefetch_lead: Duration,
        max_prefetch_lead: Duration,
        workers: usize,
    ) -> Result<Self, CacheError> {
        check_leads(min_prefetch_lead, max_prefetch_lead)?;
        let executor = PrefetchExecutor::new("prefetch", workers)?;

        Ok(BackgroundPrefetch::create(
            min_prefetch_lead,
            max_prefetch_lead,
            executor,
            true,
        ))
    }

    /// Creates a strategy which schedules its prefetches on a shared executor.
    ///
    /// Closing the cache which uses this strategy will not shut down the executor.
    ///
    /// # Errors
    /// Fails if **min_prefetch_lead** exceeds **max_prefetch_lead**.
    pub fn with_executor(
        min_prefetch_lead: Duration,
        max_prefetch_lead: Duration,
        executor: PrefetchExecutor,
    ) -> Result<Self, CacheError> {
        check_leads(min_prefetch_lead, max_prefetch_lead)?;

        Ok(BackgroundPrefetch::create(
            min_prefetch_lead,
            max_prefetch_lead,
            executor,
            false,
        ))
    }

    fn create(
        min_prefetch_lead: Duration,
        max_prefetch_lead: Duration,
        executor: PrefetchExecutor,
        owns_executor: bool,
    ) -> Self {
        BackgroundPrefetch {
            min_prefetch_lead,
            max_prefetch_lead,
            executor,
            owns_executor,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            pending: Arc::new(AtomicBool::new(false)),
            cancellation: CancellationToken::new(),
        }
    }

    /// Specifies how long [shutdown](PrefetchStrategy::shutdown) waits for a running prefetch
    /// when the executor is owned by this strategy.
    pub fn close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Returns the minimal lead before the stale instant at which prefetching starts.
    pub fn min_prefetch_lead(&self) -> Duration {
        self.min_prefetch_lead
    }

    /// Returns the maximal lead before the stale instant at which prefetching starts.
    pub fn max_prefetch_lead(&self) -> Duration {
        self.max_prefetch_lead
    }

    /// Returns the executor used to run prefetches.
    pub fn executor(&self) -> &PrefetchExecutor {
        &self.executor
    }

    /// Determines if a prefetch is currently queued or running.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

fn check_leads(min_prefetch_lead: Duration, max_prefetch_lead: Duration) -> Result<(), CacheError> {
    if min_prefetch_lead > max_prefetch_lead {
        Err(CacheError::InvalidConfiguration(format!(
            "The minimal prefetch lead ({}) must not exceed the maximal prefetch lead ({})",
            format_duration(min_prefetch_lead),
            format_duration(max_prefetch_lead)
        )))
    } else {
        Ok(())
    }
}

#[async_trait]
impl PrefetchStrategy for BackgroundPrefetch {
    fn should_prefetch(&self) -> bool {
        !self.cancellation.is_cancelled()
    }

    fn prefetch(&self, task: RefreshTask) {
        if self.cancellation.is_cancelled() {
            return;
        }

        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another prefetch is already queued or running...
            return;
        }

        // The guard lives as long as the job: it is either dropped along with a discarded job
        // or once the refresh has completed...
        let guard = PendingGuard(self.pending.clone());
        let accepted = self.executor.submit(
            Box::new(move || {
                async move {
                    let _guard = guard;
                    task().await;
                }
                .boxed()
            }),
            self.cancellation.clone(),
        );

        if !accepted {
            log::debug!(
                "Prefetch executor {} rejected a prefetch - Retrying on the next read.",
                self.executor.name()
            );
        }
    }

    fn prefetch_lead(&self) -> Option<Duration> {
        if self.min_prefetch_lead == self.max_prefetch_lead {
            return Some(self.min_prefetch_lead);
        }

        Some(rand::thread_rng().gen_range(self.min_prefetch_lead..=self.max_prefetch_lead))
    }

    fn cancel(&self) {
        self.cancellation.cancel();
    }

    async fn shutdown(&self) {
        self.cancel();
        if self.owns_executor {
            self.executor.shutdown(self.close_timeout).await;
        }
    }
}

impl Drop for BackgroundPrefetch {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use crate::executor::PrefetchExecutor;
    use crate::strategy::{BackgroundPrefetch, PrefetchStrategy, SynchronousOnly};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn synchronous_strategies_never_prefetch() {
        let strategy = SynchronousOnly;
        assert!(!strategy.should_prefetch());
        assert_eq!(strategy.prefetch_lead(), None);
    }

    #[tokio::test]
    async fn leads_are_picked_within_bounds() {
        let strategy =
            BackgroundPrefetch::new(Duration::from_secs(60), Duration::from_secs(120), 1).unwrap();
        for _ in 0..100 {
            let lead = strategy.prefetch_lead().unwrap();
            assert!(lead >= Duration::from_secs(60));
            assert!(lead <= Duration::from_secs(120));
        }

        let fixed =
            BackgroundPrefetch::new(Duration::from_secs(30), Duration::from_secs(30), 1).unwrap();
        assert_eq!(fixed.prefetch_lead(), Some(Duration::from_secs(30)));
        assert_eq!(fixed.min_prefetch_lead(), Duration::from_secs(30));
        assert_eq!(fixed.max_prefetch_lead(), Duration::from_secs(30));
        assert_eq!(fixed.executor().workers(), 1);
    }

    #[tokio::test]
    async fn sub_millisecond_leads_stay_within_bounds() {
        let strategy =
            BackgroundPrefetch::new(Duration::from_micros(500), Duration::from_micros(900), 1)
                .unwrap();
        for _ in 0..100 {
            let lead = strategy.prefetch_lead().unwrap();
            assert!(lead >= Duration::from_micros(500));
            assert!(lead <= Duration::from_micros(900));
        }
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        assert!(
            BackgroundPrefetch::new(Duration::from_secs(120), Duration::from_secs(60), 1).is_err()
        );
        assert!(BackgroundPrefetch::new(Duration::from_secs(1), Duration::from_secs(2), 0).is_err());
    }

    #[tokio::test]
    async fn only_one_prefetch_is_pending_at_a_time() {
        let strategy =
            BackgroundPrefetch::new(Duration::from_secs(1), Duration::from_secs(2), 4).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let runs = runs.clone();
            strategy.prefetch(Box::new(move || {
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let _ = runs.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }));
        }
        assert!(strategy.is_pending());

        while strategy.is_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Once the prefetch completed, the next one is accepted...
        let second = runs.clone();
        strategy.prefetch(Box::new(move || {
            async move {
                let _ = second.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));
        while strategy.is_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_prefetches_release_their_slot() {
        let executor = PrefetchExecutor::new("test", 1).unwrap();
        let strategy = BackgroundPrefetch::with_executor(
            Duration::from_secs(1),
            Duration::from_secs(2),
            executor.clone(),
        )
        .unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let first = runs.clone();
        strategy.prefetch(Box::new(move || {
            async move {
                let _ = first.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));
        strategy.cancel();
        assert!(!strategy.should_prefetch());

        // The queued job is discarded by the executor, which also releases the pending flag...
        while strategy.is_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // ...while the shared executor itself keeps running.
        strategy.shutdown().await;
        assert!(!executor.is_shutdown());
    }
}

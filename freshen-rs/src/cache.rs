//! Provides a single value cache which transparently refreshes its value.
//!
//! A [RefreshCache] holds one [Envelope] at a time. On each call to [get](RefreshCache::get),
//! the envelope is classified relative to the current instant:
//!
//! * **Fresh**: the value is returned right away.
//! * **Prefetch window**: the value is returned right away, but a background refresh is requested
//!   from the [PrefetchStrategy]. No matter how many callers find the value in this state, only a
//!   single prefetch is scheduled.
//! * **Stale** (or no value has been loaded yet): the caller has to wait. If no refresh is
//!   running, the caller starts one, otherwise it joins the running one (this includes a running
//!   prefetch). Once the refresh completes, the caller re-evaluates the new envelope. If the
//!   refresh failed, all callers waiting for it receive the failure.
//!
//! # Single flight
//! At most one refresh is running at any given time, no matter if it was triggered by a stale
//! read or by a prefetch. The running refresh is kept as a shared future in a mutex protected
//! slot. The mutex is only held to decide whether a new refresh has to be started, never while
//! the refresh itself runs, so that readers of fresh values are never blocked.
//!
//! The refresh itself runs in a task of its own. Therefore a caller which stops waiting (its
//! future is dropped) neither cancels the refresh nor leaves other waiters behind.
//!
//! # Publishing
//! Envelopes are immutable and published via an **ArcSwapOption**. A reader either observes the
//! old or the new envelope, but never a partially updated one. A refresh which yields an envelope
//! that is already stale is treated as a failure, as handing out such a value would violate the
//! contract of **get**.
//!
//! # Example
//! ```
//! # use freshen::cache::RefreshCache;
//! # use freshen::envelope::Envelope;
//! # use freshen::strategy::SynchronousOnly;
//! # use std::sync::atomic::{AtomicUsize, Ordering};
//! # use std::sync::Arc;
//! # use std::time::{Duration, Instant};
//! # #[tokio::main]
//! # async fn main() {
//! let calls = Arc::new(AtomicUsize::new(0));
//! let counter = calls.clone();
//! let cache = RefreshCache::builder(move || {
//!     let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
//!     async move {
//!         Ok(Envelope::new(format!("token-{}", call), Instant::now() + Duration::from_secs(60)))
//!     }
//! })
//! .prefetch_strategy(SynchronousOnly)
//! .build();
//!
//! // The first read has to load the value...
//! assert_eq!(cache.get().await.unwrap(), "token-1");
//! // ...all subsequent ones are served from the cache.
//! assert_eq!(cache.get().await.unwrap(), "token-1");
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//! # }
//! ```
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::builder::Builder;
use crate::envelope::{Envelope, Freshness};
use crate::error::CacheError;
use crate::metrics::Metrics;
use crate::observer::{RefreshObserver, Trigger};
use crate::refresher::Refresher;
use crate::strategy::PrefetchStrategy;

/// Represents a running refresh which can be awaited by any number of callers.
type Flight = Shared<BoxFuture<'static, Result<(), CacheError>>>;

/// Holds a single value and keeps it fresh.
///
/// See the [module documentation](crate::cache) for a detailed description.
pub struct RefreshCache<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    name: String,
    current: ArcSwapOption<Envelope<T>>,
    flight: Mutex<Option<Flight>>,
    refresher: Box<dyn Refresher<T>>,
    strategy: Box<dyn PrefetchStrategy>,
    observer: Arc<dyn RefreshObserver>,
    closed: AtomicBool,
    metrics: Metrics,
}

/// Empties the single flight slot once the refresh task is done (even if it was aborted).
struct ReleaseFlight<'a>(&'a Mutex<Option<Flight>>);

impl Drop for ReleaseFlight<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

impl<T: Send + Sync + 'static> RefreshCache<T> {
    /// Creates a builder for a cache which obtains its values from the given refresher.
    pub fn builder(refresher: impl Refresher<T> + 'static) -> Builder<T> {
        Builder::new(refresher)
    }

    pub(crate) fn create(
        name: String,
        refresher: Box<dyn Refresher<T>>,
        strategy: Box<dyn PrefetchStrategy>,
        observer: Arc<dyn RefreshObserver>,
    ) -> Self {
        RefreshCache {
            inner: Arc::new(Inner {
                name,
                current: ArcSwapOption::empty(),
                flight: Mutex::new(None),
                refresher,
                strategy,
                observer,
                closed: AtomicBool::new(false),
                metrics: Metrics::default(),
            }),
        }
    }

    /// Returns the current value, refreshing it if required.
    ///
    /// # Errors
    /// * [CacheError::CacheClosed] if [close](RefreshCache::close) has already been called.
    /// * [CacheError::RefreshFailed] if the value was stale (or not loaded yet) and the refresh
    ///   which the caller waited for failed. The next call will attempt another refresh.
    pub async fn get(&self) -> Result<T, CacheError>
    where
        T: Clone,
    {
        if self.is_closed() {
            return Err(CacheError::CacheClosed);
        }

        let mut first_attempt = true;
        loop {
            let current = self.inner.current.load_full();
            let state = current
                .as_ref()
                .map(|envelope| envelope.state_at(Instant::now()))
                .unwrap_or(Freshness::Stale);

            if first_attempt {
                self.inner.metrics.record_read(state);
                first_attempt = false;
            }

            match (current, state) {
                (Some(envelope), Freshness::Fresh) => return Ok(envelope.value().clone()),
                (Some(envelope), Freshness::PrefetchWindow) => {
                    Inner::schedule_prefetch(&self.inner, &envelope);
                    return Ok(envelope.value().clone());
                }
                (observed, _) => {
                    // Either wait for the refresh we started or joined, or - if another refresh
                    // superseded our envelope in the meantime - simply re-evaluate...
                    if let Some(flight) = Inner::join_or_start(&self.inner, observed, Trigger::Stale)
                    {
                        flight.await?;
                    }
                }
            }
        }
    }

    /// Returns the currently published envelope without triggering any refresh.
    pub fn current(&self) -> Option<Arc<Envelope<T>>> {
        self.inner.current.load_full()
    }

    /// Returns the name of this cache as used in log messages.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the metrics of this cache.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Determines if a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.inner.flight.lock().is_some()
    }

    /// Determines if [close](RefreshCache::close) has already been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes the cache.
    ///
    /// Pending background refreshes are cancelled. If the prefetch strategy owns its executor, the
    /// executor is stopped and a running prefetch is awaited for a bounded amount of time.
    /// A caller which is already waiting for a refresh will still receive its result, but all
    /// subsequent calls to [get](RefreshCache::get) fail with [CacheError::CacheClosed].
    ///
    /// Closing a cache more than once has no effect.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!("Closing cache {}...", self.inner.name);
        self.inner.strategy.shutdown().await;
    }
}

impl<T> Drop for RefreshCache<T> {
    fn drop(&mut self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.strategy.cancel();
        }
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    /// Returns the running refresh or starts a new one.
    ///
    /// Returns **None** if the **observed** envelope has already been replaced, as the caller has
    /// to re-evaluate the new one instead of refreshing it again.
    fn join_or_start(
        this: &Arc<Self>,
        observed: Option<Arc<Envelope<T>>>,
        trigger: Trigger,
    ) -> Option<Flight> {
        let mut flight = this.flight.lock();
        if let Some(running) = flight.as_ref() {
            return Some(running.clone());
        }

        let superseded = match (this.current.load_full(), observed) {
            (Some(current), Some(observed)) => !Arc::ptr_eq(&current, &observed),
            (None, None) => false,
            _ => true,
        };
        if superseded {
            return None;
        }

        let inner = this.clone();
        let task = tokio::spawn(async move { inner.perform_refresh(trigger).await });
        let running = async move {
            match task.await {
                Ok(result) => result,
                Err(error) => Err(CacheError::refresh_failed(anyhow::anyhow!(
                    "The refresh task did not complete: {}",
                    error
                ))),
            }
        }
        .boxed()
        .shared();

        *flight = Some(running.clone());
        Some(running)
    }

    /// Hands a refresh of the **observed** envelope to the prefetch strategy.
    fn schedule_prefetch(this: &Arc<Self>, observed: &Arc<Envelope<T>>) {
        if !this.strategy.should_prefetch() || this.closed.load(Ordering::Acquire) {
            return;
        }

        // A running refresh will replace the envelope anyway...
        if this.flight.lock().is_some() {
            return;
        }

        let inner = Arc::downgrade(this);
        let observed = observed.clone();
        this.strategy.prefetch(Box::new(move || {
            async move {
                if let Some(inner) = inner.upgrade() {
                    if let Some(flight) =
                        Inner::join_or_start(&inner, Some(observed), Trigger::Prefetch)
                    {
                        // Failures have already been reported by the refresh itself...
                        let _ = flight.await;
                    }
                }
            }
            .boxed()
        }));
    }

    async fn perform_refresh(&self, trigger: Trigger) -> Result<(), CacheError> {
        let watch = std::time::Instant::now();

        let result = {
            let _release = ReleaseFlight(&self.flight);
            match AssertUnwindSafe(self.refresher.refresh())
                .catch_unwind()
                .await
            {
                Ok(Ok(envelope)) => self.publish(envelope),
                Ok(Err(error)) => Err(error),
                Err(panic) => Err(anyhow::anyhow!(
                    "The refresh operation panicked: {}",
                    panic_message(panic.as_ref())
                )),
            }
        };

        match result {
            Ok(valid_for) => {
                let duration = watch.elapsed();
                self.metrics.record_refresh(duration);
                self.observer
                    .refreshed(&self.name, trigger, valid_for, duration);
                Ok(())
            }
            Err(error) => {
                self.metrics.record_failure(&error);
                self.observer.refresh_failed(&self.name, trigger, &error);
                Err(CacheError::refresh_failed(error))
            }
        }
    }

    /// Publishes the given envelope and returns how long it stays usable.
    fn publish(&self, envelope: Envelope<T>) -> anyhow::Result<Duration> {
        let now = Instant::now();
        if envelope.stale_at() <= now {
            return Err(anyhow::anyhow!(
                "The refresh operation of {} returned a value which is already stale",
                self.name
            ));
        }

        let envelope = envelope.resolve_prefetch(self.strategy.prefetch_lead(), now);
        let valid_for = envelope.stale_at().duration_since(now);
        self.current.store(Some(Arc::new(envelope)));

        Ok(valid_for)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    }
}

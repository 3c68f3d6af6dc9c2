//! Provides a builder which is used to setup a [RefreshCache].
//!
//! Only the refresh operation is mandatory. Everything else has a sensible default:
//!
//! * The **name** (used in log messages and passed to the observer) defaults to "cache".
//! * The **prefetch strategy** defaults to [SynchronousOnly], so that values are only refreshed
//!   once they are stale.
//! * The **observer** defaults to [LogObserver] which reports all refreshes via the **log** crate.
//!
//! # Example
//! Setting up a cache which prefetches its value in the background:
//! ```
//! # use freshen::builder::Builder;
//! # use freshen::envelope::Envelope;
//! # use freshen::observer::LogObserver;
//! # use freshen::strategy::BackgroundPrefetch;
//! # use std::time::{Duration, Instant};
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let cache = Builder::new(|| async {
//!     Ok(Envelope::new(42, Instant::now() + Duration::from_secs(3600)))
//! })
//! .name("answer")
//! .prefetch_strategy(BackgroundPrefetch::new(
//!     Duration::from_secs(60),
//!     Duration::from_secs(120),
//!     1,
//! )?)
//! .observer(LogObserver)
//! .build();
//!
//! assert_eq!(cache.name(), "answer");
//! assert_eq!(cache.get().await?, 42);
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use crate::cache::RefreshCache;
use crate::observer::{LogObserver, RefreshObserver};
use crate::refresher::Refresher;
use crate::strategy::{PrefetchStrategy, SynchronousOnly};

/// Collects the components of a [RefreshCache].
///
/// A builder is most commonly obtained via [RefreshCache::builder].
pub struct Builder<T> {
    name: String,
    refresher: Box<dyn Refresher<T>>,
    strategy: Box<dyn PrefetchStrategy>,
    observer: Arc<dyn RefreshObserver>,
}

impl<T: Send + Sync + 'static> Builder<T> {
    /// Creates a new builder for a cache which is filled by the given refresher.
    pub fn new(refresher: impl Refresher<T> + 'static) -> Self {
        Builder {
            name: "cache".to_owned(),
            refresher: Box::new(refresher),
            strategy: Box::new(SynchronousOnly),
            observer: Arc::new(LogObserver),
        }
    }

    /// Specifies the name of the cache.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Specifies the strategy which decides if and how values are prefetched.
    pub fn prefetch_strategy(mut self, strategy: impl PrefetchStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    /// Specifies an already boxed strategy.
    ///
    /// This is used for strategies which are determined at runtime, e.g. by
    /// [CacheSettings::into_strategy](crate::config::CacheSettings::into_strategy).
    pub fn boxed_prefetch_strategy(mut self, strategy: Box<dyn PrefetchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Specifies the observer which is notified about each refresh.
    pub fn observer(mut self, observer: impl RefreshObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Specifies an observer which is shared with other caches.
    pub fn shared_observer(mut self, observer: Arc<dyn RefreshObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Creates the cache.
    ///
    /// Note that the cache is empty. The value is loaded by the first call to
    /// [get](RefreshCache::get).
    pub fn build(self) -> RefreshCache<T> {
        log::debug!("Setting up cache {}...", self.name);
        RefreshCache::create(self.name, self.refresher, self.strategy, self.observer)
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::envelope::Envelope;
    use crate::observer::LogObserver;
    use crate::strategy::SynchronousOnly;
    use mock_instant::thread_local::Instant;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn defaults_are_applied() {
        let cache = Builder::new(|| async {
            Ok(Envelope::new("value", Instant::now() + Duration::from_secs(1)))
        })
        .build();

        assert_eq!(cache.name(), "cache");
        assert!(cache.current().is_none());
        assert_eq!(cache.get().await.unwrap(), "value");

        // Without prefetching, the prefetch instant of the envelope is its stale instant...
        let envelope = cache.current().unwrap();
        assert_eq!(envelope.prefetch_at(), Some(envelope.stale_at()));
    }

    #[tokio::test]
    async fn runtime_selected_components_are_accepted() {
        let cache = Builder::new(|| async {
            Ok(Envelope::new(1, Instant::now() + Duration::from_secs(1)))
        })
        .name("runtime")
        .boxed_prefetch_strategy(Box::new(SynchronousOnly))
        .shared_observer(Arc::new(LogObserver))
        .build();

        assert_eq!(cache.name(), "runtime");
        assert_eq!(cache.get().await.unwrap(), 1);
    }
}

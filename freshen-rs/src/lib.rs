//! Freshen keeps a single, expiring value fresh for many concurrent callers.
//!
//! # Introduction
//! Clients which talk to remote services are often handed **time limited** values: session
//! credentials, assumed-role tokens, signed URLs and the like. Fetching such a value is slow
//! (it requires a round trip to some identity service), but using it is on the hot path of every
//! request. **Freshen** provides a [RefreshCache](cache::RefreshCache) which holds one such value
//! and transparently renews it:
//!
//! * As long as the value is **fresh**, it is handed out immediately.
//! * Once it enters its **prefetch window** (it is about to expire), it is still handed out
//!   immediately, but a refresh is scheduled in the background (if the chosen
//!   [PrefetchStrategy](strategy::PrefetchStrategy) supports this).
//! * Once it is **stale**, callers wait for a refresh to complete. Only a single refresh is ever
//!   executed at a time, all other callers simply await its outcome.
//!
//! # Features
//! * **Single flight refreshes** - no matter how many tasks hit a stale value at the same time,
//!   the refresh operation is only invoked once.
//! * **Lock free reads** - the current value is published via [arc_swap] so that readers never
//!   contend with each other or with a running refresh.
//! * **Bounded background work** - prefetches run on a [PrefetchExecutor](executor::PrefetchExecutor)
//!   with a fixed worker budget and a bounded queue. An executor can be shared by many caches.
//! * **Observable** - each refresh is reported to a [RefreshObserver](observer::RefreshObserver)
//!   and recorded in the [Metrics](metrics::Metrics) of the cache.
//! * **Reload-aware config** - strategies can be described in a YAML file (see [config]).
//!
//! # Example
//! ```
//! # use freshen::cache::RefreshCache;
//! # use freshen::envelope::Envelope;
//! # use freshen::strategy::BackgroundPrefetch;
//! # use std::time::{Duration, Instant};
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let cache = RefreshCache::builder(|| async {
//!     // Fetch a new token from some remote service here...
//!     Ok(Envelope::new("token".to_owned(), Instant::now() + Duration::from_secs(15 * 60)))
//! })
//! .name("session-token")
//! .prefetch_strategy(BackgroundPrefetch::new(
//!     Duration::from_secs(60),
//!     Duration::from_secs(5 * 60),
//!     2,
//! )?)
//! .build();
//!
//! assert_eq!(cache.get().await?, "token");
//!
//! cache.close().await;
//! assert!(cache.get().await.is_err());
//! # Ok(())
//! # }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod cache;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod fmt;
pub mod metrics;
pub mod observer;
pub mod refresher;
pub mod strategy;

/// Contains the version of the Freshen library.
pub const FRESHEN_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Initializes the logging system.
///
/// The library itself only ever logs via the **log** facade. Applications which don't bring
/// their own logger can call this to log to stdout.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

#[cfg(test)]
mod testing {
    /// Executes async code within a single threaded tokio runtime.
    ///
    /// Note that the mocked clock used in tests is thread local. Therefore all tasks which
    /// look at the clock have to run on the thread which advances it.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}

//! Keeps track of the read and refresh activity of a cache.
//!
//! All counters are internally mutable and only rely on atomic operations, so that recording a
//! read never slows down the hot path of a cache. The only exception is the description of the
//! last failure, which is published via an **ArcSwapOption** just like the envelope itself.
//!
//! # Example
//!
//! ```
//! # use freshen::metrics::Average;
//! # use std::time::Duration;
//! let avg = Average::new();
//! avg.add(Duration::from_millis(10));
//! avg.add(Duration::from_millis(20));
//! avg.add(Duration::from_millis(30));
//!
//! assert_eq!(avg.avg(), Duration::from_millis(20));
//! assert_eq!(avg.count(), 3);
//! ```
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;

use crate::envelope::Freshness;
use crate::fmt::format_short_duration;

/// Computes a sliding average of a series of durations.
///
/// The sum (in microseconds) and the number of samples of the sliding window are packed into a
/// single **u64** so that both can be updated with a single atomic store. Once the window holds
/// more than 100 samples or the sum would overflow, both halves are divided by two.
#[derive(Default)]
pub struct Average {
    sum_and_count: AtomicU64,
    count: AtomicU64,
}

impl Average {
    /// Creates a new and empty average.
    pub fn new() -> Average {
        Average::default()
    }

    fn unpack(&self) -> (u32, u32) {
        let packed = self.sum_and_count.load(Ordering::Relaxed);
        ((packed >> 32) as u32, (packed & 0xFFFF_FFFF) as u32)
    }

    /// Records another duration.
    pub fn add(&self, duration: Duration) {
        let _ = self.count.fetch_add(1, Ordering::Relaxed);

        let value = u32::try_from(duration.as_micros()).unwrap_or(u32::MAX);
        let (mut sum, mut count) = self.unpack();

        while count > 100 || sum.checked_add(value).is_none() {
            if count <= 1 {
                sum = 0;
                count = 0;
            } else {
                sum /= 2;
                count /= 2;
            }
        }

        sum += value;
        count += 1;

        self.sum_and_count
            .store((sum as u64) << 32 | count as u64, Ordering::Relaxed);
    }

    /// Returns the total number of recorded durations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the sliding average of (roughly) the last 100 durations.
    pub fn avg(&self) -> Duration {
        match self.unpack() {
            (_, 0) => Duration::ZERO,
            (sum, count) => Duration::from_micros((sum / count) as u64),
        }
    }
}

impl Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", format_short_duration(self.avg()), self.count())
    }
}

/// Describes the most recent refresh failure of a cache.
#[derive(Debug, Clone)]
pub struct Failure {
    message: String,
    at: Instant,
}

impl Failure {
    /// Returns the (fully formatted) error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the instant at which the failure was recorded.
    pub fn at(&self) -> Instant {
        self.at
    }
}

/// Contains the metrics of a single cache.
#[derive(Default)]
pub struct Metrics {
    reads: AtomicU64,
    fresh_reads: AtomicU64,
    prefetch_reads: AtomicU64,
    stale_reads: AtomicU64,
    refreshes: AtomicU64,
    failures: AtomicU64,
    refresh_duration: Average,
    last_failure: ArcSwapOption<Failure>,
}

impl Metrics {
    pub(crate) fn record_read(&self, state: Freshness) {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);
        let counter = match state {
            Freshness::Fresh => &self.fresh_reads,
            Freshness::PrefetchWindow => &self.prefetch_reads,
            Freshness::Stale => &self.stale_reads,
        };
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh(&self, duration: Duration) {
        let _ = self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.refresh_duration.add(duration);
        self.last_failure.store(None);
    }

    pub(crate) fn record_failure(&self, error: &anyhow::Error) {
        let _ = self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(Some(Arc::new(Failure {
            message: format!("{:#}", error),
            at: Instant::now(),
        })));
    }

    /// Returns the total number of calls to **get**.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of reads which found a fresh value.
    pub fn fresh_reads(&self) -> u64 {
        self.fresh_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of reads which found a value in its prefetch window.
    pub fn prefetch_reads(&self) -> u64 {
        self.prefetch_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of reads which found a stale value (or no value at all) and therefore
    /// had to wait for a refresh.
    pub fn stale_reads(&self) -> u64 {
        self.stale_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of successful refreshes.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Returns the number of failed refreshes (including background ones).
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Returns the sliding average of the duration of successful refreshes.
    pub fn refresh_duration(&self) -> &Average {
        &self.refresh_duration
    }

    /// Returns the last refresh failure, unless a refresh succeeded since then.
    ///
    /// This is purely diagnostic: a failed background refresh never affects what is served.
    pub fn last_failure(&self) -> Option<Arc<Failure>> {
        self.last_failure.load_full()
    }
}

impl Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reads: {} (fresh: {}, prefetch: {}, stale: {}), Refreshes: {}, Failures: {}, Refresh duration: {}",
            self.reads(),
            self.fresh_reads(),
            self.prefetch_reads(),
            self.stale_reads(),
            self.refreshes(),
            self.failures(),
            self.refresh_duration
        )?;

        if let Some(failure) = self.last_failure() {
            write!(f, ", Last failure: {}", failure.message())?;
        }

        Ok(())
    }
}

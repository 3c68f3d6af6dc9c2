//! Provides the immutable envelope which pairs a cached value with its two time thresholds.
//!
//! Each envelope knows two instants:
//! * **stale_at**: once this has been reached, the value must not be handed out without trying to
//!   refresh it first.
//! * **prefetch_at**: once this has been reached (but **stale_at** hasn't), the value is still
//!   perfectly usable, but a refresh should be started eagerly in the background.
//!
//! A refresh operation may leave the prefetch instant open. In this case the cache derives it
//! from the lead of its [PrefetchStrategy](crate::strategy::PrefetchStrategy) once the envelope is
//! published.
//!
//! # Examples
//! ```
//! # use freshen::envelope::{Envelope, Freshness};
//! # use std::time::{Duration, Instant};
//! let now = Instant::now();
//! let envelope = Envelope::with_prefetch(
//!     "token",
//!     now + Duration::from_secs(10),
//!     now + Duration::from_secs(8),
//! )
//! .unwrap();
//!
//! assert_eq!(envelope.state_at(now), Freshness::Fresh);
//! assert_eq!(envelope.state_at(now + Duration::from_secs(9)), Freshness::PrefetchWindow);
//! assert_eq!(envelope.state_at(now + Duration::from_secs(10)), Freshness::Stale);
//!
//! // A prefetch window which would start after the value is already stale is rejected...
//! assert!(Envelope::with_prefetch(
//!     "token",
//!     now + Duration::from_secs(8),
//!     now + Duration::from_secs(10),
//! )
//! .is_err());
//! ```
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::time::Duration;

use crate::error::CacheError;

/// Classifies an envelope relative to a given instant.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Freshness {
    /// The value can be handed out, no refresh is required.
    Fresh,

    /// The value can still be handed out, but a background refresh should be attempted.
    PrefetchWindow,

    /// The value must not be handed out without attempting a refresh first.
    Stale,
}

/// Pairs a value with the instants at which it should be prefetched and at which it goes stale.
///
/// An envelope is never modified once it has been created. A refresh always produces a new one
/// which replaces its predecessor.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    value: T,
    stale_at: Instant,
    prefetch_at: Option<Instant>,
}

impl<T> Envelope<T> {
    /// Creates an envelope which leaves the prefetch instant to the cache.
    ///
    /// The cache will pick a prefetch instant based on the lead time of its prefetch strategy.
    pub fn new(value: T, stale_at: Instant) -> Self {
        Envelope {
            value,
            stale_at,
            prefetch_at: None,
        }
    }

    /// Creates an envelope with an explicit prefetch instant.
    ///
    /// # Errors
    /// Fails with [CacheError::InvalidRefreshWindow] if **prefetch_at** lies after **stale_at**.
    pub fn with_prefetch(
        value: T,
        stale_at: Instant,
        prefetch_at: Instant,
    ) -> Result<Self, CacheError> {
        if prefetch_at > stale_at {
            return Err(CacheError::InvalidRefreshWindow {
                overshoot: prefetch_at.duration_since(stale_at),
            });
        }

        Ok(Envelope {
            value,
            stale_at,
            prefetch_at: Some(prefetch_at),
        })
    }

    /// Returns the cached value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Consumes the envelope and returns the cached value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Returns the instant at which the value goes stale.
    pub fn stale_at(&self) -> Instant {
        self.stale_at
    }

    /// Returns the instant at which a background refresh should be attempted.
    ///
    /// This is **None** if neither the refresh operation nor the cache specified one.
    pub fn prefetch_at(&self) -> Option<Instant> {
        self.prefetch_at
    }

    /// Classifies this envelope relative to the given instant.
    ///
    /// An envelope without a prefetch instant has no prefetch window: it is fresh until it is
    /// stale.
    pub fn state_at(&self, now: Instant) -> Freshness {
        if now >= self.stale_at {
            Freshness::Stale
        } else if self.prefetch_at.map(|at| now >= at).unwrap_or(false) {
            Freshness::PrefetchWindow
        } else {
            Freshness::Fresh
        }
    }

    /// Returns a copy of this envelope with a resolved prefetch instant.
    ///
    /// If a prefetch instant is already present, it is kept. Otherwise it is placed **lead**
    /// before the stale instant, but never before **now**. Without a lead, the prefetch instant
    /// equals the stale instant so that no prefetch window exists.
    pub(crate) fn resolve_prefetch(self, lead: Option<Duration>, now: Instant) -> Self {
        if self.prefetch_at.is_some() {
            return self;
        }

        let prefetch_at = match lead {
            Some(lead) => self
                .stale_at
                .checked_sub(lead)
                .filter(|at| *at > now)
                .unwrap_or(now),
            None => self.stale_at,
        };

        Envelope {
            prefetch_at: Some(prefetch_at.min(self.stale_at)),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::envelope::{Envelope, Freshness};
    use crate::error::CacheError;
    use mock_instant::thread_local::{Instant, MockClock};
    use std::time::Duration;

    #[test]
    fn states_follow_the_clock() {
        let now = Instant::now();
        let envelope = Envelope::with_prefetch(
            42,
            now + Duration::from_secs(10),
            now + Duration::from_secs(8),
        )
        .unwrap();

        assert_eq!(envelope.state_at(Instant::now()), Freshness::Fresh);

        MockClock::advance(Duration::from_secs(8));
        assert_eq!(envelope.state_at(Instant::now()), Freshness::PrefetchWindow);

        MockClock::advance(Duration::from_secs(1));
        assert_eq!(envelope.state_at(Instant::now()), Freshness::PrefetchWindow);

        MockClock::advance(Duration::from_secs(1));
        assert_eq!(envelope.state_at(Instant::now()), Freshness::Stale);
        assert_eq!(*envelope.value(), 42);
        assert_eq!(envelope.into_value(), 42);
    }

    #[test]
    fn inverted_windows_are_rejected() {
        let now = Instant::now();
        match Envelope::with_prefetch(
            "x",
            now + Duration::from_secs(5),
            now + Duration::from_secs(7),
        ) {
            Err(CacheError::InvalidRefreshWindow { overshoot }) => {
                assert_eq!(overshoot, Duration::from_secs(2))
            }
            _ => panic!("An inverted refresh window must be rejected!"),
        }

        // Equal instants are fine, there is just no prefetch window...
        let envelope =
            Envelope::with_prefetch("x", now + Duration::from_secs(5), now + Duration::from_secs(5))
                .unwrap();
        assert_eq!(envelope.state_at(now), Freshness::Fresh);
    }

    #[test]
    fn envelopes_without_prefetch_instant_have_no_window() {
        let now = Instant::now();
        let envelope = Envelope::new("x", now + Duration::from_secs(5));

        assert_eq!(envelope.prefetch_at(), None);
        assert_eq!(
            envelope.state_at(now + Duration::from_secs(4)),
            Freshness::Fresh
        );
        assert_eq!(
            envelope.state_at(now + Duration::from_secs(5)),
            Freshness::Stale
        );
    }

    #[test]
    fn prefetch_instants_are_resolved_from_the_lead() {
        MockClock::advance(Duration::from_secs(60));
        let now = Instant::now();

        // An explicit prefetch instant always wins...
        let explicit = Envelope::with_prefetch(
            1,
            now + Duration::from_secs(30),
            now + Duration::from_secs(20),
        )
        .unwrap()
        .resolve_prefetch(Some(Duration::from_secs(5)), now);
        assert_eq!(explicit.prefetch_at(), Some(now + Duration::from_secs(20)));

        // Otherwise the lead is subtracted from the stale instant...
        let derived = Envelope::new(1, now + Duration::from_secs(30))
            .resolve_prefetch(Some(Duration::from_secs(5)), now);
        assert_eq!(derived.prefetch_at(), Some(now + Duration::from_secs(25)));

        // ...but the window never opens before now...
        let clamped = Envelope::new(1, now + Duration::from_secs(30))
            .resolve_prefetch(Some(Duration::from_secs(120)), now);
        assert_eq!(clamped.prefetch_at(), Some(now));

        // ...and without a lead, there is no window at all.
        let synchronous =
            Envelope::new(1, now + Duration::from_secs(30)).resolve_prefetch(None, now);
        assert_eq!(synchronous.prefetch_at(), Some(now + Duration::from_secs(30)));
    }
}

//! Permits to observe the refresh activity of a cache.
//!
//! Background refreshes fail silently as far as callers are concerned: the current value is still
//! usable, so it keeps being served. To still make such failures visible, each cache reports all
//! refresh outcomes to a [RefreshObserver]. By default this is the [LogObserver] which simply
//! emits log messages.
use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::fmt::format_duration;

/// Describes why a refresh was started.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Trigger {
    /// A caller found the value stale (or the cache empty) and waits for the refresh.
    Stale,

    /// A caller found the value within its prefetch window and scheduled a background refresh.
    Prefetch,
}

impl Display for Trigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Stale => write!(f, "stale"),
            Trigger::Prefetch => write!(f, "prefetch"),
        }
    }
}

/// Receives the outcome of each refresh performed by a cache.
///
/// Note that these callbacks are invoked from within the refresh task itself, therefore they
/// should return quickly.
pub trait RefreshObserver: Send + Sync {
    /// Invoked once a new envelope has been published.
    ///
    /// **valid_for** is the time left until the new value goes stale and **duration** is the time
    /// the refresh operation took.
    fn refreshed(&self, cache: &str, trigger: Trigger, valid_for: Duration, duration: Duration);

    /// Invoked if a refresh failed.
    ///
    /// For [Trigger::Prefetch] this is the only place where the failure becomes visible, unless
    /// a caller found the value stale in the meantime and joined the refresh.
    fn refresh_failed(&self, cache: &str, trigger: Trigger, error: &anyhow::Error);
}

/// Reports all refresh activity via the **log** facade.
#[derive(Debug, Default, Copy, Clone)]
pub struct LogObserver;

impl RefreshObserver for LogObserver {
    fn refreshed(&self, cache: &str, trigger: Trigger, valid_for: Duration, duration: Duration) {
        log::info!(
            "Refreshed {} ({}) in {} - Value goes stale in {}.",
            cache,
            trigger,
            format_duration(duration),
            format_duration(valid_for)
        );
    }

    fn refresh_failed(&self, cache: &str, trigger: Trigger, error: &anyhow::Error) {
        match trigger {
            Trigger::Stale => log::error!("Failed to refresh {}: {:#}", cache, error),
            Trigger::Prefetch => log::warn!(
                "Failed to prefetch {}: {:#} - Keeping the current value for now.",
                cache,
                error
            ),
        }
    }
}

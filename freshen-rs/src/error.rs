//! Provides the error type reported by the [RefreshCache](crate::cache::RefreshCache).
//!
//! Note that refresh operations themselves report their failures as **anyhow::Error**, as the
//! cache treats them as opaque. Once such a failure reaches a caller, it is wrapped in
//! [CacheError::RefreshFailed]. As a single failure is shared by all callers which waited for
//! the same refresh, the cause is kept in an **Arc**.
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Enumerates the errors reported by the cache.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// An envelope was constructed with a prefetch instant after its stale instant.
    InvalidRefreshWindow {
        /// Determines how far the prefetch instant lies after the stale instant.
        overshoot: Duration,
    },

    /// A refresh was required in order to serve the caller, but it failed.
    ///
    /// The cache remains usable, the next call will attempt another refresh.
    RefreshFailed(Arc<anyhow::Error>),

    /// The cache has already been closed.
    CacheClosed,

    /// A prefetch strategy or executor was configured with invalid settings.
    InvalidConfiguration(String),
}

impl CacheError {
    /// Wraps the given cause into a [CacheError::RefreshFailed].
    pub fn refresh_failed(cause: anyhow::Error) -> Self {
        CacheError::RefreshFailed(Arc::new(cause))
    }
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::InvalidRefreshWindow { overshoot } => write!(
                f,
                "Invalid refresh window: the prefetch time lies {:?} after the stale time",
                overshoot
            ),
            CacheError::RefreshFailed(cause) => {
                write!(f, "Failed to refresh the cached value: {:#}", cause)
            }
            CacheError::CacheClosed => write!(f, "The cache has already been closed"),
            CacheError::InvalidConfiguration(message) => {
                write!(f, "Invalid cache configuration: {}", message)
            }
        }
    }
}

impl Error for CacheError {}

#[cfg(test)]
mod tests {
    use crate::error::CacheError;
    use std::time::Duration;

    #[test]
    fn errors_are_formatted_with_their_cause() {
        let error = CacheError::refresh_failed(
            anyhow::anyhow!("connection refused").context("Cannot reach the token service"),
        );
        assert_eq!(
            error.to_string(),
            "Failed to refresh the cached value: Cannot reach the token service: connection refused"
        );

        assert_eq!(
            CacheError::InvalidRefreshWindow {
                overshoot: Duration::from_secs(2)
            }
            .to_string(),
            "Invalid refresh window: the prefetch time lies 2s after the stale time"
        );
        assert_eq!(
            CacheError::CacheClosed.to_string(),
            "The cache has already been closed"
        );
    }
}

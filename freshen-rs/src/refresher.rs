//! Describes the refresh operation which produces new envelopes for a cache.
//!
//! The cache treats the refresh operation as a black box: it is invoked without arguments and
//! either yields a new [Envelope](crate::envelope::Envelope) or fails with an arbitrary error.
//!
//! Most probably a closure is all that is needed, as any `Fn() -> impl Future` which yields an
//! **anyhow::Result<Envelope<T>>** is a [Refresher]. For more involved cases (e.g. a provider
//! which keeps a client around), the trait can be implemented directly:
//!
//! ```
//! # use freshen::envelope::Envelope;
//! # use freshen::refresher::Refresher;
//! # use std::time::{Duration, Instant};
//! struct TokenService {
//!     endpoint: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Refresher<String> for TokenService {
//!     async fn refresh(&self) -> anyhow::Result<Envelope<String>> {
//!         // Perform the actual request against self.endpoint here...
//!         let expiration = Instant::now() + Duration::from_secs(3600);
//!
//!         Ok(Envelope::with_prefetch(
//!             format!("token-from-{}", self.endpoint),
//!             expiration - Duration::from_secs(60),
//!             expiration - Duration::from_secs(5 * 60),
//!         )?)
//!     }
//! }
//! ```
use std::future::Future;

use async_trait::async_trait;

use crate::envelope::Envelope;

/// Produces a fresh envelope on demand.
///
/// Note that the cache guarantees that at most one refresh is running at any given time, so
/// implementations don't need to guard against concurrent invocations themselves.
#[async_trait]
pub trait Refresher<T>: Send + Sync {
    /// Obtains a new value along with its stale (and optionally its prefetch) instant.
    async fn refresh(&self) -> anyhow::Result<Envelope<T>>;
}

#[async_trait]
impl<T, F, Fut> Refresher<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Envelope<T>>> + Send + 'static,
{
    async fn refresh(&self) -> anyhow::Result<Envelope<T>> {
        (self)().await
    }
}

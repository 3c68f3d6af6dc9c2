//! Demonstrates a refresh cache which keeps a session token of a simulated token service fresh.
//!
//! The setup of the cache is read from **config/settings.yml**. Once this file changes, the cache
//! is closed and re-created using the new settings.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use freshen::cache::RefreshCache;
use freshen::config::{run_config_change_monitor, CacheSettings, Config, Handle};
use freshen::envelope::Envelope;
use freshen::fmt::{format_duration, parse_duration};
use freshen::refresher::Refresher;
use freshen::FRESHEN_VERSION;
use tokio_util::sync::CancellationToken;

mod signals;

const CACHE_NAME: &str = "session-token";

/// Simulates a remote service which hands out short-lived session tokens.
struct TokenIssuer {
    issued: AtomicUsize,
    ttl: Duration,
    latency: Duration,
}

#[async_trait]
impl Refresher<String> for TokenIssuer {
    async fn refresh(&self) -> anyhow::Result<Envelope<String>> {
        tokio::time::sleep(self.latency).await;
        let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Envelope::new(
            format!("session-{:04}", serial),
            Instant::now() + self.ttl,
        ))
    }
}

/// Contains the settings of the demo itself.
struct DemoSettings {
    token_ttl: Duration,
    issuer_latency: Duration,
    poll_interval: Duration,
}

impl DemoSettings {
    fn from_config(handle: &Handle) -> anyhow::Result<Self> {
        let read = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            match handle.query(format!("demo.{}", key)).as_str() {
                Some(value) => parse_duration(value),
                None => Ok(default),
            }
        };

        Ok(DemoSettings {
            token_ttl: read("token_ttl", Duration::from_secs(30))?,
            issuer_latency: read("issuer_latency", Duration::from_millis(250))?,
            poll_interval: read("poll_interval", Duration::from_secs(1))?,
        })
    }
}

fn create_cache(config: &Config) -> anyhow::Result<(RefreshCache<String>, Duration)> {
    let handle = config.current();
    let demo = DemoSettings::from_config(&handle)?;
    let settings = CacheSettings::from_config(&handle, CACHE_NAME)?;
    log::info!(
        "Setting up {} using a {:?} strategy (tokens are valid for {})...",
        CACHE_NAME,
        settings.strategy,
        format_duration(demo.token_ttl)
    );

    let issuer = TokenIssuer {
        issued: AtomicUsize::new(0),
        ttl: demo.token_ttl,
        latency: demo.issuer_latency,
    };

    let cache = RefreshCache::builder(issuer)
        .name(CACHE_NAME)
        .boxed_prefetch_strategy(settings.into_strategy()?)
        .build();

    Ok((cache, demo.poll_interval))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    freshen::init_logging();
    log::info!("||. FRESHEN DEMO (v {})", FRESHEN_VERSION);

    let shutdown = CancellationToken::new();
    signals::install(shutdown.clone());

    if let Err(error) = tokio::fs::create_dir_all("config").await {
        log::warn!("Failed to create config base directory: {}", error);
    }
    let config = Arc::new(Config::new("config/settings.yml"));
    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }
    let mut notifier = config.notifier();
    run_config_change_monitor(config.clone(), shutdown.clone());

    let (mut cache, poll_interval) = create_cache(&config)?;
    let mut ticker = tokio::time::interval(poll_interval);
    let mut polls = 0_u64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            change = notifier.recv() => {
                if change.is_err() {
                    continue;
                }
                match create_cache(&config) {
                    Ok((new_cache, poll_interval)) => {
                        let old_cache = std::mem::replace(&mut cache, new_cache);
                        old_cache.close().await;
                        log::info!("Metrics of the replaced cache: {}", old_cache.metrics());
                        ticker = tokio::time::interval(poll_interval);
                    }
                    Err(error) => log::error!("Keeping the current cache, as the new config is invalid: {:#}", error),
                }
            }
            _ = ticker.tick() => {
                polls += 1;
                match cache.get().await {
                    Ok(token) => log::info!("Using {}", token),
                    Err(error) => log::error!("Failed to obtain a token: {}", error),
                }
                if polls % 10 == 0 {
                    log::info!("{}", cache.metrics());
                }
            }
        }
    }

    cache.close().await;
    log::info!("Final metrics: {}", cache.metrics());

    Ok(())
}

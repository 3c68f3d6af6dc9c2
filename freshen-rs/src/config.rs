//! Contains the configuration of caches.
//!
//! Provides access to a YAML configuration which is either loaded from a file (e.g.
//! **config/settings.yml**) or from a string. The file can be observed for changes using
//! [run_config_change_monitor]. Therefore each user of the config should attach itself to the
//! [Config::notifier](Config::notifier) and re-process the config once a change message is
//! received.
//!
//! Note that the **Config** struct is kind of constant and can be created once and then be kept
//! around. However, when using **Config::current()** to obtain the current config handle, this
//! should not be stored, as it will not be updated once a new config has been loaded.
//!
//! # Cache settings
//! The settings of a cache are read from **caches.<name>**:
//! ```yaml
//! caches:
//!     session-token:
//!         # Either "synchronous" or "background"
//!         strategy: background
//!         # Durations accept "ms", "s", "m", "h" and "d" as suffix. Plain numbers are milliseconds.
//!         min_prefetch_lead: 1m
//!         max_prefetch_lead: 5m
//!         # The worker budget of the background executor (defaults to the number of CPUs).
//!         workers: 2
//!         # How long closing the cache waits for a running prefetch.
//!         close_timeout: 5s
//! ```
//!
//! # Examples
//!
//! Loading and reading the config:
//! ```
//! # use freshen::config::{CacheSettings, Config, StrategyKind};
//! # use std::time::Duration;
//! let config = Config::new("settings.yml");
//! config.load_from_string("
//! caches:
//!     session-token:
//!         strategy: background
//!         min_prefetch_lead: 30s
//!         max_prefetch_lead: 2m
//! ", None).unwrap();
//!
//! let settings = CacheSettings::from_config(&config.current(), "session-token").unwrap();
//! assert_eq!(settings.strategy, StrategyKind::Background);
//! assert_eq!(settings.min_prefetch_lead, Duration::from_secs(30));
//! assert_eq!(settings.max_prefetch_lead, Duration::from_secs(120));
//! ```
//!
//! Attaching a change listener:
//! ```no_run
//! # use freshen::config::Config;
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() {
//! let config = Arc::new(Config::new("config/settings.yml"));
//! let mut notifier = config.notifier();
//! tokio::spawn(async move {
//!     loop {
//!         // Wait for a config change. This will most probably be combined with other events
//!         // using tokio::select!...
//!         match notifier.recv().await {
//!             Ok(_) => log::info!("Config update received..."),
//!             _ => return,
//!         }
//!     }
//! });
//! # }
//! ```
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use yaml_rust::{Yaml, YamlLoader};

use crate::error::CacheError;
use crate::fmt::parse_duration;
use crate::strategy::{
    BackgroundPrefetch, PrefetchStrategy, SynchronousOnly, DEFAULT_CLOSE_TIMEOUT,
};

/// Determines how often the change monitor checks the config file.
const CHANGE_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Provides access to a (reloadable) configuration.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be updated
/// if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new (empty) config which reads the given file once [load](Config::load) is
    /// invoked.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        }
    }

    /// Returns the name of the underlying file.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// We check that it is a file, as an unmounted docker volume is presented as directory.
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Reads the underlying file.
    ///
    /// A missing file is not an error, the config simply remains empty (so that all caches
    /// use their default settings).
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        let last_modified = match self.last_modified().await {
            Some(last_modified) => last_modified,
            None => {
                log::info!(
                    "Config file {} doesn't exist or is an unmounted docker volume - skipping config load.",
                    &self.filename
                );
                return Ok(());
            }
        };

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        self.load_from_string(config_data.as_str(), Some(last_modified))
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// If the data cannot be parsed, the previous configuration is kept and no change is
    /// broadcast.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data).map_err(|error| {
            anyhow::anyhow!("Cannot parse config file {}: {}", &self.filename, error)
        })?;

        let doc = if docs.is_empty() {
            Yaml::Null
        } else {
            docs.swap_remove(0)
        };

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the currently loaded configuration.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a dotted path like "caches.session-token.workers".
    ///
    /// Returns **Yaml::BadValue** if the path doesn't exist.
    pub fn query(&self, query: impl AsRef<str>) -> &Yaml {
        query
            .as_ref()
            .split('.')
            .fold(&self.config.0, |yaml, key| &yaml[key])
    }
}

/// Starts a task which checks the config file every two seconds and reloads it once it changed.
///
/// Note that this will only watch the "last modified" date of the file and will not perform a
/// structural comparison. Therefore it is the duty of each config user to gracefully handle
/// partial config changes. The task stops once the given token is cancelled.
pub fn run_config_change_monitor(config: Arc<Config>, shutdown: CancellationToken) {
    let _ = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(CHANGE_MONITOR_INTERVAL) => (),
            }

            // This will contain the last modified date of the file on disk or be None if the
            // file is absent...
            let last_modified = config.last_modified().await;

            // Contains the timestamp when the file was loaded the last time or be None if no
            // data has been loaded yet...
            let last_loaded = config.config.load().1;

            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("Config {} was re-loaded.", config.filename),
                    Err(error) => log::error!("Failed to re-load config: {:#}", error),
                }
            }
        }
    });
}

/// Enumerates the available prefetch strategies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StrategyKind {
    /// Selects [SynchronousOnly].
    Synchronous,
    /// Selects [BackgroundPrefetch].
    Background,
}

/// Describes how a cache is set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Selects the prefetch strategy.
    pub strategy: StrategyKind,
    /// The minimal time before the stale instant at which a prefetch is started.
    pub min_prefetch_lead: Duration,
    /// The maximal time before the stale instant at which a prefetch is started.
    pub max_prefetch_lead: Duration,
    /// The worker budget of the background executor.
    pub workers: usize,
    /// How long closing the cache waits for a running prefetch.
    pub close_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            strategy: StrategyKind::Synchronous,
            min_prefetch_lead: Duration::from_secs(60),
            max_prefetch_lead: Duration::from_secs(5 * 60),
            workers: num_cpus::get(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl CacheSettings {
    /// Reads the settings of the given cache from **caches.<name>**.
    ///
    /// Everything which isn't specified falls back to its default.
    pub fn from_config(handle: &Handle, name: &str) -> anyhow::Result<Self> {
        let config = &handle.config()["caches"][name];
        let defaults = CacheSettings::default();

        let strategy = match &config["strategy"] {
            Yaml::String(strategy) if strategy.eq_ignore_ascii_case("synchronous") => {
                StrategyKind::Synchronous
            }
            Yaml::String(strategy) if strategy.eq_ignore_ascii_case("background") => {
                StrategyKind::Background
            }
            Yaml::BadValue | Yaml::Null => defaults.strategy,
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid strategy for cache {}: {:?}. Use either 'synchronous' or 'background'.",
                    name,
                    other
                ))
            }
        };

        let workers = match &config["workers"] {
            Yaml::Integer(workers) if *workers > 0 => *workers as usize,
            Yaml::BadValue | Yaml::Null => defaults.workers,
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid worker budget for cache {}: {:?}. Expected a positive number.",
                    name,
                    other
                ))
            }
        };

        Ok(CacheSettings {
            strategy,
            min_prefetch_lead: read_duration(
                config,
                name,
                "min_prefetch_lead",
                defaults.min_prefetch_lead,
            )?,
            max_prefetch_lead: read_duration(
                config,
                name,
                "max_prefetch_lead",
                defaults.max_prefetch_lead,
            )?,
            workers,
            close_timeout: read_duration(config, name, "close_timeout", defaults.close_timeout)?,
        })
    }

    /// Creates the prefetch strategy described by these settings.
    ///
    /// # Errors
    /// Fails if the settings of a background strategy are inconsistent.
    ///
    /// # Panics
    /// Creating a background strategy panics if called outside of a tokio runtime.
    pub fn into_strategy(self) -> Result<Box<dyn PrefetchStrategy>, CacheError> {
        match self.strategy {
            StrategyKind::Synchronous => Ok(Box::new(SynchronousOnly)),
            StrategyKind::Background => Ok(Box::new(
                BackgroundPrefetch::new(self.min_prefetch_lead, self.max_prefetch_lead, self.workers)?
                    .close_timeout(self.close_timeout),
            )),
        }
    }
}

fn read_duration(
    config: &Yaml,
    name: &str,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    match &config[key] {
        Yaml::String(value) => parse_duration(value)
            .with_context(|| format!("Invalid setting {} for cache {}", key, name)),
        Yaml::Integer(millis) if *millis >= 0 => Ok(Duration::from_millis(*millis as u64)),
        Yaml::BadValue | Yaml::Null => Ok(default),
        other => Err(anyhow::anyhow!(
            "Invalid setting {} for cache {}: {:?}",
            key,
            name,
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CacheSettings, Config, StrategyKind};
    use crate::strategy::{PrefetchStrategy, SynchronousOnly};
    use std::time::{Duration, SystemTime};

    #[test]
    fn ensure_config_update_works() {
        crate::testing::test_async(async {
            let config = Config::new("test.yml");

            // Load an initial config...
            config
                .load_from_string("test: 42", Some(SystemTime::now()))
                .unwrap();

            // Setup a task which notifies our oneshot channel once the config changes...
            let mut change_notifier = config.notifier();
            let (tx, rx) = tokio::sync::oneshot::channel();
            let _ = tokio::spawn(async move {
                if change_notifier.recv().await.is_ok() {
                    tx.send(()).unwrap();
                }
            });

            // Ensure that a malformed config is simply ignored...
            assert!(config
                .load_from_string("test: 'invalid", Some(SystemTime::now()))
                .is_err());
            assert_eq!(config.current().query("test").as_i64().unwrap(), 42);

            // Change the config...
            config
                .load_from_string("test: 4242", Some(SystemTime::now()))
                .unwrap();

            // Await oneshot message
            rx.await.unwrap();

            // Ensure that new config is now present...
            assert_eq!(config.current().query("test").as_i64().unwrap(), 4242);
        });
    }

    #[test]
    fn missing_files_leave_the_config_empty() {
        crate::testing::test_async(async {
            let config = Config::new("this/file/does/not/exist.yml");
            config.load().await.unwrap();

            assert!(config.current().query("caches.token").is_badvalue());
            assert_eq!(
                CacheSettings::from_config(&config.current(), "token").unwrap(),
                CacheSettings::default()
            );
        });
    }

    #[test]
    fn settings_are_read_with_defaults() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
caches:
    token:
        strategy: Background
        min_prefetch_lead: 10s
        max_prefetch_lead: 1m
        workers: 3
    partial:
        close_timeout: 1500
",
                None,
            )
            .unwrap();

        let token = CacheSettings::from_config(&config.current(), "token").unwrap();
        assert_eq!(token.strategy, StrategyKind::Background);
        assert_eq!(token.min_prefetch_lead, Duration::from_secs(10));
        assert_eq!(token.max_prefetch_lead, Duration::from_secs(60));
        assert_eq!(token.workers, 3);
        assert_eq!(token.close_timeout, Duration::from_secs(5));

        let partial = CacheSettings::from_config(&config.current(), "partial").unwrap();
        assert_eq!(partial.strategy, StrategyKind::Synchronous);
        assert_eq!(partial.close_timeout, Duration::from_millis(1500));
        assert_eq!(partial.workers, num_cpus::get());
    }

    #[test]
    fn invalid_settings_are_reported() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
caches:
    strategy:
        strategy: eventually
    workers:
        workers: 0
    lead:
        min_prefetch_lead: 3 years
",
                None,
            )
            .unwrap();

        for name in ["strategy", "workers", "lead"] {
            assert!(CacheSettings::from_config(&config.current(), name).is_err());
        }
    }

    #[test]
    fn oversized_worker_budgets_are_rejected() {
        crate::testing::test_async(async {
            let config = Config::new("huge.yml");
            assert_eq!(config.filename(), "huge.yml");
            config
                .load_from_string(
                    "
caches:
    token:
        strategy: background
        workers: 4611686018427387904
",
                    None,
                )
                .unwrap();

            let settings = CacheSettings::from_config(&config.current(), "token").unwrap();
            assert_eq!(settings.workers, 4611686018427387904);
            assert!(settings.into_strategy().is_err());
        });
    }

    #[test]
    fn strategies_are_created_from_settings() {
        crate::testing::test_async(async {
            let synchronous = CacheSettings::default().into_strategy().unwrap();
            assert!(!synchronous.should_prefetch());
            assert_eq!(synchronous.prefetch_lead(), SynchronousOnly.prefetch_lead());

            let background = CacheSettings {
                strategy: StrategyKind::Background,
                min_prefetch_lead: Duration::from_secs(5),
                max_prefetch_lead: Duration::from_secs(5),
                workers: 1,
                close_timeout: Duration::from_secs(1),
            }
            .into_strategy()
            .unwrap();
            assert!(background.should_prefetch());
            assert_eq!(background.prefetch_lead(), Some(Duration::from_secs(5)));
            background.shutdown().await;

            // Inconsistent leads are rejected...
            assert!(CacheSettings {
                strategy: StrategyKind::Background,
                min_prefetch_lead: Duration::from_secs(10),
                max_prefetch_lead: Duration::from_secs(5),
                workers: 1,
                close_timeout: Duration::from_secs(1),
            }
            .into_strategy()
            .is_err());
        });
    }
}

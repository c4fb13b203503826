use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the resolver.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "locator".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Freshness windows of the in-memory cache.
///
/// Negative answers ("the remote side does not know this key") are revalidated far sooner than
/// positive ones, so `negative_ttl` must be shorter than `positive_ttl`. Configuration files
/// violating this are rejected.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Time to live of an entry that holds a value.
    #[serde(with = "humantime_serde")]
    pub positive_ttl: Duration,

    /// Time to live of an entry for a key the remote side had no value for.
    #[serde(with = "humantime_serde")]
    pub negative_ttl: Duration,
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.negative_ttl >= self.positive_ttl {
            anyhow::bail!(
                "cache.negative_ttl ({}) must be shorter than cache.positive_ttl ({})",
                humantime::format_duration(self.negative_ttl),
                humantime::format_duration(self.positive_ttl),
            );
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl: Duration::from_secs(3600 * 24 * 30),
            negative_ttl: Duration::from_secs(3600 * 24),
        }
    }
}

/// Pacing and backoff of the remote dispatch queue.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of tasks waiting for dispatch. Further enqueues are rejected.
    pub max_queue_size: usize,

    /// Maximum number of remote calls in flight at the same time.
    pub max_concurrent: usize,

    /// Minimum time between two consecutive dispatches.
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,

    /// Pause after each settled dispatch before the slot is released again.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Wait after the first throttling signal. Doubles with every consecutive signal.
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    /// Upper bound for a single sleep while waiting for a rate limit window to lapse.
    #[serde(with = "humantime_serde")]
    pub recheck_cap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_concurrent: 1,
            min_interval: Duration::from_secs(2),
            cooldown: Duration::from_millis(200),
            base_backoff: Duration::from_secs(5 * 60),
            recheck_cap: Duration::from_secs(60),
        }
    }
}

/// Connection settings of the remote lookup service.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the lookup endpoint. The key is appended as the last path segment.
    pub base_url: Option<url::Url>,

    /// Deadline for a single lookup. A lookup that misses it is treated as "no answer".
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Additional headers sent with every lookup.
    pub headers: BTreeMap<String, String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
            headers: BTreeMap::new(),
        }
    }
}

/// Durable storage of the cache and the usage counts.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding the persisted records. Default is to keep everything in memory.
    pub storage_dir: Option<PathBuf>,

    /// Quiet period after the last mutation before the state is written.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Interval of the forced flush, regardless of recent activity.
    #[serde(with = "humantime_serde")]
    pub periodic_interval: Duration,

    /// Storage quota in bytes.
    pub quota_bytes: u64,

    /// Flushes are skipped once storage usage reaches this percentage of the quota.
    pub flush_threshold_percent: u8,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            debounce: Duration::from_secs(5),
            periodic_interval: Duration::from_secs(30),
            quota_bytes: 10 * 1024 * 1024,
            flush_threshold_percent: 90,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,

    /// Fine-tune cache expiry
    pub cache: CacheConfig,

    /// Remote dispatch pacing.
    pub queue: QueueConfig,

    /// The remote lookup service.
    pub remote: RemoteConfig,

    /// Durable storage.
    pub persistence: PersistenceConfig,

    /// Presentation strings for raw values, e.g. `FR: France`.
    pub display_names: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            remote: RemoteConfig::default(),
            persistence: PersistenceConfig::default(),
            display_names: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.cache.validate().context("invalid cache configuration")?;
        Ok(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        // It should be possible to set individual windows in reasonable units without
        // affecting the other defaults.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache.negative_ttl, Duration::from_secs(3600 * 24));

        let yaml = r#"
            cache:
              negative_ttl: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.negative_ttl, Duration::from_secs(3600));
        assert_eq!(
            cfg.cache.positive_ttl,
            CacheConfig::default().positive_ttl
        );
        assert_eq!(cfg.queue, QueueConfig::default());
    }

    #[test]
    fn test_negative_ttl_shorter_by_default() {
        let cfg = CacheConfig::default();
        assert!(cfg.negative_ttl < cfg.positive_ttl);
    }

    #[test]
    fn test_rejects_negative_ttl_not_shorter() {
        let yaml = r#"
            cache:
              positive_ttl: 1h
              negative_ttl: 2h
        "#;
        let error = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert_eq!(
            format!("{:#}", error),
            "invalid cache configuration: cache.negative_ttl (2h) must be shorter than cache.positive_ttl (1h)"
        );

        let yaml = r#"
            cache:
              positive_ttl: 1h
              negative_ttl: 1h
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_queue_config() {
        let yaml = r#"
            queue:
              max_queue_size: 5
              min_interval: 500ms
              base_backoff: 1m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.queue.max_queue_size, 5);
        assert_eq!(cfg.queue.min_interval, Duration::from_millis(500));
        assert_eq!(cfg.queue.base_backoff, Duration::from_secs(60));
        assert_eq!(cfg.queue.cooldown, Duration::from_millis(200));
        assert_eq!(cfg.queue.max_concurrent, 1);
    }

    #[test]
    fn test_remote_and_display() {
        let yaml = r#"
            remote:
              base_url: "http://localhost:1234/lookup/"
              timeout: 3s
              headers:
                authorization: Bearer abc
            display_names:
              FR: France
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.remote.base_url.unwrap().as_str(),
            "http://localhost:1234/lookup/"
        );
        assert_eq!(cfg.remote.timeout, Duration::from_secs(3));
        assert_eq!(cfg.remote.headers["authorization"], "Bearer abc");
        assert_eq!(cfg.display_names["FR"], "France");
    }

    #[test]
    fn test_log_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            persistence:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}

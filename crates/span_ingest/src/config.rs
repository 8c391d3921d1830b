//! Configuration loading.
//!
//! Sources are merged in order, later ones winning:
//! 1. defaults
//! 2. `span_ingest.toml` in the working directory
//! 3. environment variables prefixed with `SPAN_INGEST_`, nested with `__`
//!    (`SPAN_INGEST_EXPORTER__MAX_RETRIES=5`)

use crate::retry::RetryConfig;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Deserializer};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "span_ingest.toml";
pub const ENV_PREFIX: &str = "SPAN_INGEST_";

pub const DEFAULT_MAX_CONCURRENT_SENDS: usize = 8;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;
/// One hour
pub const DEFAULT_SERIES_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;
/// One day
pub const DEFAULT_SERIES_LOOKBACK_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_PROVISION_RETRY_DELAY_MS: u64 = 5_000;

#[derive(Debug, Error)]
#[error("failed to load configuration: {0}")]
pub struct ConfigError(#[from] Box<figment::Error>);

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self(Box::new(err))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Unmarshal pool size; 0 uses one worker per processor.
    pub unmarshal_workers: usize,
    pub exporter: ExporterConfig,
}

impl IngestConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Loads from `path` instead of the default file. A missing file is not
    /// an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::figment(path).extract().map_err(ConfigError::from)
    }

    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn unmarshal_worker_count(&self) -> usize {
        or_available_parallelism(self.unmarshal_workers)
    }
}

/// Columnar exporter settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Writer tasks; 0 uses one per processor.
    pub workers: usize,
    /// Batches being sent at once, across all writers.
    pub max_concurrent_sends: usize,
    /// Retries after a failed send before the batch is dropped.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_initial_delay_ms: u64,
    /// Cap on the retry delay.
    pub retry_max_delay_ms: u64,
    /// Growth factor between consecutive retry delays.
    pub retry_backoff_multiplier: f64,
    /// How often the oldest half of the series cache is evicted; 0 disables
    /// eviction.
    pub series_cleanup_interval_secs: u64,
    /// Window of stored series ids loaded into the cache at startup.
    pub series_lookback_secs: u64,
    /// Wait between startup loads while the tables are not provisioned.
    pub provision_retry_delay_ms: u64,
    /// Tag keys kept inline on series rows instead of deduplicated. Accepts a
    /// list or a comma-separated string.
    #[serde(deserialize_with = "comma_separated")]
    pub high_cardinality_keys: Vec<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            retry_backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
            series_cleanup_interval_secs: DEFAULT_SERIES_CLEANUP_INTERVAL_SECS,
            series_lookback_secs: DEFAULT_SERIES_LOOKBACK_SECS,
            provision_retry_delay_ms: DEFAULT_PROVISION_RETRY_DELAY_MS,
            high_cardinality_keys: Vec::new(),
        }
    }
}

impl ExporterConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_concurrent_sends(mut self, sends: usize) -> Self {
        self.max_concurrent_sends = sends;
        self
    }

    pub fn with_retry(mut self, retry: &RetryConfig) -> Self {
        self.max_retries = retry.max_retries;
        self.retry_initial_delay_ms = retry.initial_delay.as_millis() as u64;
        self.retry_max_delay_ms = retry.max_delay.as_millis() as u64;
        self.retry_backoff_multiplier = retry.backoff_multiplier;
        self
    }

    pub fn with_series_cleanup_interval(mut self, interval: Duration) -> Self {
        self.series_cleanup_interval_secs = interval.as_secs();
        self
    }

    pub fn with_series_lookback(mut self, lookback: Duration) -> Self {
        self.series_lookback_secs = lookback.as_secs();
        self
    }

    pub fn with_provision_retry_delay(mut self, delay: Duration) -> Self {
        self.provision_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_high_cardinality_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.high_cardinality_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn worker_count(&self) -> usize {
        or_available_parallelism(self.workers)
    }

    /// At least one send is always allowed.
    pub fn send_permits(&self) -> usize {
        self.max_concurrent_sends.max(1)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    /// `None` when eviction is disabled.
    pub fn series_cleanup_interval(&self) -> Option<Duration> {
        (self.series_cleanup_interval_secs > 0)
            .then(|| Duration::from_secs(self.series_cleanup_interval_secs))
    }

    pub fn series_lookback(&self) -> Duration {
        Duration::from_secs(self.series_lookback_secs)
    }

    pub fn provision_retry_delay(&self) -> Duration {
        Duration::from_millis(self.provision_retry_delay_ms)
    }
}

fn or_available_parallelism(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

fn comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Keys {
        List(Vec<String>),
        Joined(String),
    }

    let keys = match Keys::deserialize(deserializer)? {
        Keys::List(keys) => keys,
        Keys::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(keys
        .into_iter()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_without_sources() {
        Jail::expect_with(|_jail| {
            let config = IngestConfig::load().unwrap();
            assert_eq!(config, IngestConfig::default());
            assert_eq!(config.exporter.max_retries, DEFAULT_MAX_RETRIES);
            assert!(config.exporter.worker_count() >= 1);
            assert_eq!(
                config.exporter.series_cleanup_interval(),
                Some(Duration::from_secs(3600))
            );
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                unmarshal_workers = 4

                [exporter]
                max_retries = 7
                max_concurrent_sends = 2
                high_cardinality_keys = ["terminus_key", "instance_id"]
                "#,
            )?;
            jail.set_env("SPAN_INGEST_EXPORTER__MAX_RETRIES", "9");

            let config = IngestConfig::load().unwrap();
            assert_eq!(config.unmarshal_workers, 4);
            assert_eq!(config.unmarshal_worker_count(), 4);
            assert_eq!(config.exporter.max_retries, 9);
            assert_eq!(config.exporter.max_concurrent_sends, 2);
            assert_eq!(
                config.exporter.high_cardinality_keys,
                vec!["terminus_key", "instance_id"]
            );
            Ok(())
        });
    }

    #[test]
    fn test_comma_separated_keys_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env(
                "SPAN_INGEST_EXPORTER__HIGH_CARDINALITY_KEYS",
                "terminus_key, instance_id,,",
            );
            let config = IngestConfig::load().unwrap();
            assert_eq!(
                config.exporter.high_cardinality_keys,
                vec!["terminus_key", "instance_id"]
            );
            Ok(())
        });
    }

    #[test]
    fn test_invalid_value_is_error() {
        Jail::expect_with(|jail| {
            jail.set_env("SPAN_INGEST_EXPORTER__MAX_RETRIES", "lots");
            let err = IngestConfig::load().unwrap_err();
            assert!(err.to_string().contains("failed to load configuration"));
            Ok(())
        });
    }

    #[test]
    fn test_derived_values() {
        let config = ExporterConfig::default()
            .with_max_concurrent_sends(0)
            .with_series_cleanup_interval(Duration::ZERO)
            .with_series_lookback(Duration::from_secs(90))
            .with_retry(&RetryConfig {
                max_retries: 1,
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(400),
                backoff_multiplier: 3.0,
            });

        assert_eq!(config.send_permits(), 1);
        assert_eq!(config.series_cleanup_interval(), None);
        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 1);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
        assert_eq!(retry.max_delay, Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(150));
        assert_eq!(config.series_lookback(), Duration::from_secs(90));
    }

    #[test]
    fn test_backoff_multiplier_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env("SPAN_INGEST_EXPORTER__RETRY_BACKOFF_MULTIPLIER", "1.5");
            let config = IngestConfig::load().unwrap();
            let retry = config.exporter.retry_config();
            assert!((retry.backoff_multiplier - 1.5).abs() < f64::EPSILON);
            assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(225));
            Ok(())
        });
    }
}

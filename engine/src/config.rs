//! Engine configuration.

use crate::store::DEFAULT_MAX_ATTEMPTS;
use crate::MergeStrategy;
use std::env;
use std::time::Duration;

/// Configuration for a [`crate::Repository`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// sqlx SQLite URL of the local database
    pub database_url: String,
    /// Operations dequeued per batch while draining
    pub push_batch_size: usize,
    /// Failed pushes before an operation becomes terminal
    pub max_attempts: u32,
    /// Deadline for each gateway call
    pub request_timeout: Duration,
    /// Periodic sync interval; `None` disables the timer
    pub sync_interval: Option<Duration>,
    /// Retry delays after retryable failures
    pub backoff: BackoffConfig,
    /// Conflict policy used when no custom resolver is supplied
    pub merge_strategy: MergeStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            push_batch_size: 50,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: Duration::from_secs(30),
            sync_interval: Some(Duration::from_secs(15 * 60)),
            backoff: BackoffConfig::default(),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Load from `TETHER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("TETHER_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(secs) = parse::<u64>(&lookup, "TETHER_SYNC_INTERVAL_SECS")? {
            config.sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(attempts) = parse::<u32>(&lookup, "TETHER_MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ConfigError::Invalid {
                    key: "TETHER_MAX_ATTEMPTS",
                    value: attempts.to_string(),
                });
            }
            config.max_attempts = attempts;
        }
        if let Some(secs) = parse::<u64>(&lookup, "TETHER_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "TETHER_BACKOFF_MAX_SECS")? {
            config.backoff.max = Duration::from_secs(secs);
        }
        if let Some(size) = parse::<usize>(&lookup, "TETHER_PUSH_BATCH_SIZE")? {
            config.push_batch_size = size.max(1);
        }
        if let Some(strategy) = parse::<MergeStrategy>(&lookup, "TETHER_MERGE_STRATEGY")? {
            config.merge_strategy = strategy;
        }

        Ok(config)
    }

    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the periodic sync interval. `None` disables the timer.
    pub fn with_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Exponential backoff for retryable push failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// First delay
    pub initial: Duration,
    /// Upper bound
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Self::default()
        }
    }

    /// Delay before retry number `failures` (1-based). Zero means no delay.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

//! Scheduler configuration.
//!
//! Worker pool sizing, retry budget and backoff curve, per-attempt timeout,
//! shutdown behaviour and the default queue name used for unkeyed pushes.

use std::time::Duration;

use crate::error::ConfigError;

/// Maximum number of retries for a failed task in async mode.
pub const DEFAULT_ASYNC_RETRIES: u32 = 10;

/// Queue key used when a push arrives with an empty key and no resource scope.
pub const DEFAULT_QUEUE: &str = "default";

/// Configuration for a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker tasks. 0 means one per available CPU.
    pub workers: usize,
    /// Retries allowed after the first failed attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
    /// Growth factor applied to the delay after every failed attempt.
    pub backoff_multiplier: f64,
    /// Optional limit on a single attempt of a task body.
    pub task_timeout: Option<Duration>,
    /// How long `shutdown` waits for draining before giving up.
    pub shutdown_timeout: Duration,
    /// Tasks a worker runs from one lane before handing it back.
    pub lane_batch: usize,
    /// Queue key substituted for empty keys.
    pub default_queue: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            retries: DEFAULT_ASYNC_RETRIES,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            task_timeout: None,
            shutdown_timeout: Duration::from_secs(60),
            lane_batch: 32,
            default_queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with the given worker count.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the first delay and the cap of the backoff curve.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_lane_batch(mut self, batch: usize) -> Self {
        self.lane_batch = batch;
        self
    }

    pub fn with_default_queue(mut self, name: impl Into<String>) -> Self {
        self.default_queue = name.into();
        self
    }

    /// Worker count after resolving 0 to the host's parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KEYED_QUEUE_WORKERS`: Worker count, 0 for auto (default: 0)
    /// - `KEYED_QUEUE_RETRIES`: Retries after the first failure (default: 10)
    /// - `KEYED_QUEUE_BASE_DELAY_MS`: First retry delay (default: 100)
    /// - `KEYED_QUEUE_MAX_DELAY_MS`: Retry delay cap (default: 10000)
    /// - `KEYED_QUEUE_BACKOFF_MULTIPLIER`: Delay growth factor (default: 2.0)
    /// - `KEYED_QUEUE_TASK_TIMEOUT_SECS`: Per-attempt timeout, 0 disables (default: none)
    /// - `KEYED_QUEUE_SHUTDOWN_TIMEOUT_SECS`: Drain timeout (default: 60)
    /// - `KEYED_QUEUE_LANE_BATCH`: Tasks per lane claim (default: 32)
    /// - `KEYED_QUEUE_DEFAULT_QUEUE`: Key for unkeyed pushes (default: "default")
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("KEYED_QUEUE_WORKERS") {
            config.workers = parse_env_value(&val, "KEYED_QUEUE_WORKERS")?;
        }

        if let Some(val) = lookup("KEYED_QUEUE_RETRIES") {
            config.retries = parse_env_value(&val, "KEYED_QUEUE_RETRIES")?;
        }

        if let Some(val) = lookup("KEYED_QUEUE_BASE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "KEYED_QUEUE_BASE_DELAY_MS")?;
            config.base_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("KEYED_QUEUE_MAX_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "KEYED_QUEUE_MAX_DELAY_MS")?;
            config.max_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("KEYED_QUEUE_BACKOFF_MULTIPLIER") {
            config.backoff_multiplier = parse_env_value(&val, "KEYED_QUEUE_BACKOFF_MULTIPLIER")?;
        }

        if let Some(val) = lookup("KEYED_QUEUE_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "KEYED_QUEUE_TASK_TIMEOUT_SECS")?;
            config.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(val) = lookup("KEYED_QUEUE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "KEYED_QUEUE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("KEYED_QUEUE_LANE_BATCH") {
            config.lane_batch = parse_env_value(&val, "KEYED_QUEUE_LANE_BATCH")?;
        }

        if let Some(val) = lookup("KEYED_QUEUE_DEFAULT_QUEUE") {
            config.default_queue = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay < self.base_delay {
            return Err(ConfigError::ValidationFailed(
                "max_delay must not be smaller than base_delay".to_string(),
            ));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "backoff_multiplier must be a finite value >= 1.0".to_string(),
            ));
        }

        if self.lane_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "lane_batch must be greater than 0".to_string(),
            ));
        }

        if self.default_queue.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_queue cannot be empty".to_string(),
            ));
        }

        if matches!(self.task_timeout, Some(t) if t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse an environment variable value into the requested type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

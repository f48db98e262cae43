//! Process configuration.
//!
//! Values come from `BATCHRUN_*` environment variables (plus `REDIS_URL`),
//! with CLI flags applied on top by the binary.

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::job::{BackoffPolicy, QueueName, DEFAULT_MAX_ATTEMPTS};
use crate::scheduler::worker_pool::WorkerPoolConfig;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a batchrun process.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    // Redis
    pub redis_url: String,
    /// Prefix of every Redis key and channel.
    pub key_prefix: String,

    // Workers
    /// Workers per consumed queue.
    pub num_workers: usize,
    pub queues: Vec<QueueName>,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub retry_fatal: bool,
    /// Silence after which a consumer's in-flight jobs are recovered.
    pub consumer_lease: Duration,

    // Batches
    /// Upper bound on a single notification publish.
    pub publish_timeout: Duration,
    /// Lifetime of a batch's counters.
    pub progress_ttl: Duration,
    pub run_log_ttl: Duration,
    /// Delete counters once the drained batch is finalized.
    pub cleanup_on_drain: bool,

    // Gateway
    pub gateway_url: Option<String>,
    pub gateway_api_key: Option<String>,
    pub gateway_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "batchrun".to_string(),
            num_workers: 4,
            queues: QueueName::ALL.to_vec(),
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(60),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            retry_fatal: false,
            consumer_lease: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(5),
            progress_ttl: Duration::from_secs(7 * 24 * 3600),
            run_log_ttl: Duration::from_secs(7 * 24 * 3600),
            cleanup_on_drain: true,
            gateway_url: None,
            gateway_api_key: None,
            gateway_timeout: Duration::from_secs(300),
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }
        if let Some(val) = lookup("BATCHRUN_KEY_PREFIX") {
            config.key_prefix = val;
        }
        if let Some(val) = lookup("BATCHRUN_WORKERS") {
            config.num_workers = parse_env_value(&val, "BATCHRUN_WORKERS")?;
        }
        if let Some(val) = lookup("BATCHRUN_QUEUES") {
            config.queues = parse_queues(&val, "BATCHRUN_QUEUES")?;
        }
        if let Some(val) = lookup("BATCHRUN_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "BATCHRUN_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(millis);
        }
        if let Some(val) = lookup("BATCHRUN_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BATCHRUN_JOB_TIMEOUT_SECS")?;
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("BATCHRUN_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BATCHRUN_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("BATCHRUN_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "BATCHRUN_MAX_ATTEMPTS")?;
        }
        config.backoff = parse_backoff(&lookup)?;
        if let Some(val) = lookup("BATCHRUN_RETRY_FATAL") {
            config.retry_fatal = parse_env_bool(&val, "BATCHRUN_RETRY_FATAL")?;
        }
        if let Some(val) = lookup("BATCHRUN_CONSUMER_LEASE_SECS") {
            let secs: u64 = parse_env_value(&val, "BATCHRUN_CONSUMER_LEASE_SECS")?;
            config.consumer_lease = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("BATCHRUN_PUBLISH_TIMEOUT_MS") {
            let millis: u64 = parse_env_value(&val, "BATCHRUN_PUBLISH_TIMEOUT_MS")?;
            config.publish_timeout = Duration::from_millis(millis);
        }
        if let Some(val) = lookup("BATCHRUN_PROGRESS_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "BATCHRUN_PROGRESS_TTL_SECS")?;
            config.progress_ttl = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("BATCHRUN_RUN_LOG_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "BATCHRUN_RUN_LOG_TTL_SECS")?;
            config.run_log_ttl = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("BATCHRUN_CLEANUP_ON_DRAIN") {
            config.cleanup_on_drain = parse_env_bool(&val, "BATCHRUN_CLEANUP_ON_DRAIN")?;
        }
        config.gateway_url = lookup("BATCHRUN_GATEWAY_URL").filter(|v| !v.is_empty());
        config.gateway_api_key = lookup("BATCHRUN_GATEWAY_API_KEY").filter(|v| !v.is_empty());
        if let Some(val) = lookup("BATCHRUN_GATEWAY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BATCHRUN_GATEWAY_TIMEOUT_SECS")?;
            config.gateway_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url must not be empty".to_string(),
            ));
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::ValidationFailed(
                "key_prefix must be non-empty and contain no whitespace".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queues must name at least one queue".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than zero".to_string(),
            ));
        }
        if self.consumer_lease < Duration::from_secs(4) {
            return Err(ConfigError::ValidationFailed(
                "consumer_lease must be at least 4 seconds".to_string(),
            ));
        }
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "publish_timeout must be greater than zero".to_string(),
            ));
        }
        if self.progress_ttl < self.job_timeout {
            return Err(ConfigError::ValidationFailed(
                "progress_ttl must not be shorter than job_timeout".to_string(),
            ));
        }
        if let BackoffPolicy::Exponential { base, max } = self.backoff {
            if base > max {
                return Err(ConfigError::ValidationFailed(
                    "backoff base must not exceed backoff max".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The gateway URL, which workers need to run documents.
    pub fn require_gateway_url(&self) -> Result<&str, ConfigError> {
        self.gateway_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("BATCHRUN_GATEWAY_URL".to_string()))
    }

    /// Settings for a worker pool consuming `self.queues`.
    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.num_workers)
            .with_redis_url(self.redis_url.clone())
            .with_key_prefix(self.key_prefix.clone())
            .with_queues(self.queues.clone())
            .with_poll_interval(self.poll_interval)
            .with_job_timeout(self.job_timeout)
            .with_shutdown_timeout(self.shutdown_timeout)
            .with_backoff(self.backoff)
            .with_retry_fatal(self.retry_fatal)
            .with_consumer_lease(self.consumer_lease)
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueName>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_gateway(mut self, url: impl Into<String>, api_key: Option<String>) -> Self {
        self.gateway_url = Some(url.into());
        self.gateway_api_key = api_key;
        self
    }
}

fn parse_backoff<F>(lookup: &F) -> Result<BackoffPolicy, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let base = match lookup("BATCHRUN_BACKOFF_BASE_MS") {
        Some(val) => Some(Duration::from_millis(parse_env_value(
            &val,
            "BATCHRUN_BACKOFF_BASE_MS",
        )?)),
        None => None,
    };
    let max = match lookup("BATCHRUN_BACKOFF_MAX_MS") {
        Some(val) => Some(Duration::from_millis(parse_env_value(
            &val,
            "BATCHRUN_BACKOFF_MAX_MS",
        )?)),
        None => None,
    };

    let (default_base, default_max) = match BackoffPolicy::default() {
        BackoffPolicy::Exponential { base, max } => (base, max),
        BackoffPolicy::Fixed(delay) => (delay, delay),
    };

    let kind = lookup("BATCHRUN_BACKOFF").map(|v| v.to_lowercase());
    match kind.as_deref() {
        None | Some("exponential") => Ok(BackoffPolicy::Exponential {
            base: base.unwrap_or(default_base),
            max: max.unwrap_or(default_max),
        }),
        Some("fixed") => Ok(BackoffPolicy::Fixed(base.unwrap_or(default_base))),
        Some(other) => Err(ConfigError::InvalidValue {
            key: "BATCHRUN_BACKOFF".to_string(),
            message: format!("expected 'fixed' or 'exponential', got '{}'", other),
        }),
    }
}

/// Parses a comma-separated list of queue names.
fn parse_queues(value: &str, key: &str) -> Result<Vec<QueueName>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            name.parse::<QueueName>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("unknown queue '{}'", name),
            })
        })
        .collect()
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

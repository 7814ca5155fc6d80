//! Configuration loading and validation.
//!
//! One TOML file, read once at startup. Every section is optional; durations
//! use humantime notation (`"250ms"`, `"30s"`, `"7d"`).
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:8080"
//!
//! [worker]
//! threads = 8
//! lease_duration = "30s"
//! heartbeat_interval = "10s"
//!
//! [admission.limits]
//! pro = 10
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use patchflow_observability::LogSettings;

use crate::admission::{AdmissionPolicy, PlanLimits, PlanTier};
use crate::jobs::WorkerConfig;
use crate::resilience::{BreakerConfig, Jitter, RetryPolicy};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "PATCHFLOW_CONFIG";
/// Overrides `database.url`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PatchflowConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub worker: WorkerSection,
    pub retry: RetrySection,
    pub breaker: BreakerSection,
    pub admission: AdmissionSection,
    pub idempotency: IdempotencySection,
    pub jobs: JobsSection,
    pub logging: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Absent `url` selects the in-memory backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub threads: usize,
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            threads: 4,
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            jitter: Jitter::Full,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    pub half_open_successes: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            failure_rate_threshold: defaults.failure_rate_threshold,
            window: defaults.window,
            cooldown: defaults.cooldown,
            half_open_successes: defaults.half_open_successes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionSection {
    pub default_plan: PlanTier,
    pub limits: PlanLimits,
    #[serde(with = "humantime_serde")]
    pub retry_after: Duration,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        let defaults = AdmissionPolicy::default();
        Self {
            default_plan: defaults.default_plan,
            limits: defaults.limits,
            retry_after: defaults.retry_after,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySection {
    /// How long a `processing` lock survives without its owner finishing.
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    /// How long completed results are kept for duplicate detection.
    #[serde(with = "humantime_serde")]
    pub completed_retention: Duration,
}

impl Default for IdempotencySection {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5 * 60),
            completed_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    pub default_max_retries: u32,
    /// Finished jobs and runs older than this are removed by `cleanup` jobs.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            default_max_retries: crate::jobs::types::DEFAULT_MAX_RETRIES,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl PatchflowConfig {
    /// Load from the file named by `PATCHFLOW_CONFIG` (defaults when unset),
    /// then apply `DATABASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.trim().is_empty() {
                config.database.url = Some(url);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// # Errors
    ///
    /// Returns the first constraint that does not hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        if w.threads == 0 {
            return Err(invalid("worker.threads must be at least 1"));
        }
        if w.lease_duration.is_zero() {
            return Err(invalid("worker.lease_duration must be positive"));
        }
        if w.heartbeat_interval.is_zero() || w.heartbeat_interval >= w.lease_duration {
            return Err(invalid("worker.heartbeat_interval must be positive and shorter than worker.lease_duration"));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if r.max_delay < r.base_delay {
            return Err(invalid("retry.max_delay must not be shorter than retry.base_delay"));
        }

        let b = &self.breaker;
        if b.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if !(b.failure_rate_threshold > 0.0 && b.failure_rate_threshold <= 1.0) {
            return Err(invalid("breaker.failure_rate_threshold must be in (0, 1]"));
        }
        if b.half_open_successes == 0 {
            return Err(invalid("breaker.half_open_successes must be at least 1"));
        }
        if b.window.is_zero() {
            return Err(invalid("breaker.window must be positive"));
        }

        let limits = &self.admission.limits;
        if limits.free == 0 || limits.pro == 0 || limits.enterprise == 0 {
            return Err(invalid("admission.limits must be at least 1 for every plan"));
        }

        if self.idempotency.lock_ttl.is_zero() {
            return Err(invalid("idempotency.lock_ttl must be positive"));
        }
        if w.heartbeat_interval >= self.idempotency.lock_ttl {
            return Err(invalid("worker.heartbeat_interval must be shorter than idempotency.lock_ttl"));
        }
        if self.jobs.default_max_retries == 0 {
            return Err(invalid("jobs.default_max_retries must be at least 1"));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections must be at least 1"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retry.max_attempts, self.retry.base_delay, self.retry.max_delay)
            .with_jitter(self.retry.jitter)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            failure_rate_threshold: self.breaker.failure_rate_threshold,
            window: self.breaker.window,
            cooldown: self.breaker.cooldown,
            half_open_successes: self.breaker.half_open_successes,
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            default_plan: self.admission.default_plan,
            limits: self.admission.limits,
            retry_after: self.admission.retry_after,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_threads(self.worker.threads)
            .with_lease(self.worker.lease_duration, self.worker.heartbeat_interval)
            .with_poll_interval(self.worker.poll_interval)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

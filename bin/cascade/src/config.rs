//! Application configuration.
//!
//! Loaded from a JSON file (default `./cascade.config.json`) via the
//! `config` crate, with `CASCADE__`-prefixed environment variables
//! overriding file values. The logging section falls back to the
//! `LOG_LEVEL` / `LOG_FORMAT` environment variables when absent.

use cascade_connect::BinaryDataConfig;
use cascade_durable::{RetryPolicy, SchedulerConnection, WorkerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Durable scheduler connection.
    pub scheduler: SchedulerConfig,
    /// Credential store location.
    pub credentials: CredentialsConfig,
    /// Binary-data storage.
    #[serde(default)]
    pub binary_data: BinaryDataConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Logging; env fallback applies when absent.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// Scheduler connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Substrate address, e.g. `nats://localhost:4222`. Use a `tls://`
    /// scheme for TLS connections.
    pub address: String,
    /// Namespace isolating this deployment.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Task queue workers and clients bind to.
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
    /// Worker identity reported in logs.
    #[serde(default)]
    pub identity: Option<String>,
    /// Concurrent step tasks per worker.
    #[serde(default = "default_step_concurrency")]
    pub max_concurrent_step_tasks: usize,
    /// Concurrent executions per worker.
    #[serde(default = "default_execution_concurrency")]
    pub max_concurrent_executions: usize,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_task_queue() -> String {
    "main".to_string()
}

fn default_step_concurrency() -> usize {
    10
}

fn default_execution_concurrency() -> usize {
    100
}

impl SchedulerConfig {
    /// The connection record for the durable store.
    #[must_use]
    pub fn connection(&self, task_queue_override: Option<&str>) -> SchedulerConnection {
        SchedulerConnection {
            address: self.address.clone(),
            namespace: self.namespace.clone(),
            task_queue: task_queue_override
                .unwrap_or(&self.task_queue)
                .to_string(),
        }
    }
}

/// Credential store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Path of the credential JSON file.
    pub path: PathBuf,
}

/// Execution tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Per-invocation step timeout in seconds.
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    /// Step retry policy.
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
}

fn default_step_timeout_seconds() -> u64 {
    300
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout_seconds(),
            retry_policy: RetryPolicyConfig::default(),
        }
    }
}

/// Step retry policy, as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_maximum_attempts")]
    pub maximum_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_maximum_interval_ms")]
    pub maximum_interval_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
}

fn default_maximum_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_maximum_interval_ms() -> u64 {
    60_000
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            maximum_attempts: default_maximum_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            maximum_interval_ms: default_maximum_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
        }
    }
}

impl ExecutionConfig {
    /// The worker configuration derived from this section.
    #[must_use]
    pub fn worker_config(&self, scheduler: &SchedulerConfig) -> WorkerConfig {
        WorkerConfig {
            step_timeout: Duration::from_secs(self.step_timeout_seconds),
            retry: RetryPolicy {
                maximum_attempts: self.retry_policy.maximum_attempts,
                initial_interval: Duration::from_millis(self.retry_policy.initial_interval_ms),
                maximum_interval: Duration::from_millis(self.retry_policy.maximum_interval_ms),
                backoff_coefficient: self.retry_policy.backoff_coefficient,
            },
            max_concurrent_step_tasks: scheduler.max_concurrent_step_tasks,
            max_concurrent_executions: scheduler.max_concurrent_executions,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `debug` / `info` / `warn` / `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl LoggingConfig {
    /// The effective logging settings: the config section, else the
    /// `LOG_LEVEL` / `LOG_FORMAT` environment variables, else defaults.
    #[must_use]
    pub fn effective(configured: Option<Self>) -> Self {
        configured.unwrap_or_else(|| Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| default_log_format()),
        })
    }
}

impl AppConfig {
    /// Loads configuration from a JSON file plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing file, invalid JSON, or missing
    /// required keys.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Json))
            .add_source(
                config::Environment::with_prefix("CASCADE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

//! Configuration schema definitions.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobmill_protocols::{Backoff, DEFAULT_QUEUE, ExhaustedAction, RetryPolicy};

use crate::loader::ConfigLoader;

/// Root configuration. Every section is optional; an empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Recurring entries registered at startup.
    #[serde(default)]
    pub recurring: Vec<RecurringConfig>,
}

impl Config {
    /// Default retry policy, with the retention section's exhausted action.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy().with_on_exhausted(self.retention.exhausted)
    }
}

/// `~/.jobmill`, or `.jobmill` when no home directory is known.
pub fn jobmill_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".jobmill"))
        .unwrap_or_else(|| PathBuf::from(".jobmill"))
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(ConfigLoader::expand_path(path))
}

/// Dashboard HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database file; `~` is expanded.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_db_path(),
        }
    }
}

impl StorageConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand(&self.path)
    }
}

fn default_db_path() -> String {
    "~/.jobmill/jobmill.db".to_string()
}

/// Worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker id prefix; defaults to `jobmill-{pid}`.
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Polled in order, highest priority first.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    #[serde(default = "default_worker_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Defaults to a third of the lease.
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            count: default_worker_count(),
            queues: default_queues(),
            poll_interval_ms: default_worker_poll_ms(),
            lease_secs: default_lease_secs(),
            heartbeat_secs: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_secs(&self) -> u64 {
        self.heartbeat_secs.unwrap_or(self.lease_secs / 3)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_worker_count() -> usize {
    4
}

fn default_queues() -> Vec<String> {
    vec![DEFAULT_QUEUE.to_string()]
}

fn default_worker_poll_ms() -> u64 {
    1000
}

fn default_lease_secs() -> u64 {
    300
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Misfire {
    #[default]
    Coalesce,
    FireAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_scheduler_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub misfire: Misfire,

    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_scheduler_poll_ms(),
            misfire: Misfire::default(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

fn default_scheduler_poll_ms() -> u64 {
    15_000
}

fn default_reap_interval_ms() -> u64 {
    30_000
}

/// Default retry policy for jobs and operations without their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            factor: default_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(Backoff::Exponential {
                base_ms: self.base_delay_secs.saturating_mul(1000),
                factor: self.factor,
                max_ms: self.max_delay_secs.saturating_mul(1000),
                jitter: self.jitter,
            })
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_secs() -> u64 {
    15
}

fn default_max_delay_secs() -> u64 {
    3600
}

fn default_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// What happens to a job once its retries run out.
    #[serde(default)]
    pub exhausted: ExhaustedAction,

    /// Delete exhausted failures this long after their last update.
    /// Absent keeps them for the operator.
    #[serde(default)]
    pub failed_retention_secs: Option<u64>,
}

impl RetentionConfig {
    pub fn failed_retention(&self) -> Option<Duration> {
        self.failed_retention_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory of the daily-rotated log files; `~` is expanded.
    #[serde(default = "default_log_dir")]
    pub dir: String,

    /// Write the file log as JSON lines.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand(&self.dir)
    }
}

fn default_log_dir() -> String {
    jobmill_home().join("logs").to_string_lossy().into_owned()
}

/// A recurring entry registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringConfig {
    pub id: String,
    pub cron: String,
    pub capability: String,
    pub operation: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

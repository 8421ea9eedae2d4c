//! Configuration validation.

use std::collections::HashSet;

use jobmill_core::CronExpr;

use crate::error::ConfigError;
use crate::schema::{Config, StorageBackend};

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// First error as a [`ConfigError`], if any.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(ConfigError::InvalidValue {
                field: error.path,
                message: error.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
        let mut result = ValidationResult::default();

        Self::validate_server(config, &mut result);
        Self::validate_storage(config, &mut result);
        Self::validate_worker(config, &mut result);
        Self::validate_scheduler(config, &mut result);
        Self::validate_retry(config, &mut result);
        Self::validate_recurring(config, &mut result);

        Ok(result)
    }

    fn validate_server(config: &Config, result: &mut ValidationResult) {
        if !config.server.enabled {
            return;
        }
        if config.server.port == 0 {
            result.add_error(ValidationError::new("server.port", "Port cannot be 0"));
        }
        if config.server.host.is_empty() {
            result.add_error(ValidationError::new("server.host", "Host cannot be empty"));
        }
    }

    fn validate_storage(config: &Config, result: &mut ValidationResult) {
        match config.storage.backend {
            StorageBackend::Memory => result.add_warning(ValidationWarning::new(
                "storage.backend",
                "memory backend is not durable, jobs are lost on restart",
            )),
            StorageBackend::Sqlite if config.storage.path.trim().is_empty() => {
                result.add_error(ValidationError::new(
                    "storage.path",
                    "SQLite backend requires a database path",
                ));
            }
            StorageBackend::Sqlite => {}
        }
    }

    fn validate_worker(config: &Config, result: &mut ValidationResult) {
        let worker = &config.worker;

        if worker.count == 0 {
            result.add_error(ValidationError::new(
                "worker.count",
                "count must be greater than 0",
            ));
        }

        if worker.queues.is_empty() {
            result.add_error(ValidationError::new(
                "worker.queues",
                "at least one queue is required",
            ));
        }
        if worker.queues.iter().any(|q| q.trim().is_empty()) {
            result.add_error(ValidationError::new(
                "worker.queues",
                "queue names cannot be empty",
            ));
        }

        if worker.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "worker.poll_interval_ms",
                "poll_interval_ms must be greater than 0",
            ));
        }

        if worker.lease_secs == 0 {
            result.add_error(ValidationError::new(
                "worker.lease_secs",
                "lease_secs must be greater than 0",
            ));
        } else if worker.heartbeat_secs() == 0 || worker.heartbeat_secs() >= worker.lease_secs {
            result.add_error(ValidationError::new(
                "worker.heartbeat_secs",
                format!(
                    "heartbeat_secs must be between 1 and lease_secs ({})",
                    worker.lease_secs
                ),
            ));
        }
    }

    fn validate_scheduler(config: &Config, result: &mut ValidationResult) {
        let scheduler = &config.scheduler;

        if scheduler.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "scheduler.poll_interval_ms",
                "poll_interval_ms must be greater than 0",
            ));
        } else if scheduler.poll_interval_ms > 60_000 {
            result.add_warning(ValidationWarning::new(
                "scheduler.poll_interval_ms",
                "poll interval above 60s delays minutely recurring jobs",
            ));
        }

        if scheduler.reap_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "scheduler.reap_interval_ms",
                "reap_interval_ms must be greater than 0",
            ));
        }
    }

    fn validate_retry(config: &Config, result: &mut ValidationResult) {
        let retry = &config.retry;

        if retry.max_attempts == 0 {
            result.add_error(ValidationError::new(
                "retry.max_attempts",
                "max_attempts must be at least 1",
            ));
        }
        if retry.factor < 1.0 {
            result.add_error(ValidationError::new(
                "retry.factor",
                "factor must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            result.add_error(ValidationError::new(
                "retry.jitter",
                "jitter must be between 0.0 and 1.0",
            ));
        }
        if retry.base_delay_secs > retry.max_delay_secs {
            result.add_warning(ValidationWarning::new(
                "retry.base_delay_secs",
                "base delay exceeds max delay, every retry waits max_delay_secs",
            ));
        }
    }

    fn validate_recurring(config: &Config, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (index, entry) in config.recurring.iter().enumerate() {
            let path = format!("recurring[{}]", index);

            if entry.id.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("{}.id", path),
                    "id cannot be empty",
                ));
            } else if !seen.insert(entry.id.as_str()) {
                result.add_error(ValidationError::new(
                    format!("{}.id", path),
                    format!("duplicate recurring id '{}'", entry.id),
                ));
            }

            if entry.capability.is_empty() || entry.operation.is_empty() {
                result.add_error(ValidationError::new(
                    format!("{}.capability", path),
                    "capability and operation are required",
                ));
            }

            if let Err(e) = CronExpr::parse(&entry.cron, &entry.timezone) {
                result.add_error(ValidationError::new(format!("{}.cron", path), e.to_string()));
            }

            if entry.queue.as_deref().is_some_and(|q| q.trim().is_empty()) {
                result.add_error(ValidationError::new(
                    format!("{}.queue", path),
                    "queue name cannot be empty",
                ));
            }
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;

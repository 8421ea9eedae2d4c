use super::*;
use crate::schema::RecurringConfig;

fn recurring(id: &str, cron: &str) -> RecurringConfig {
    RecurringConfig {
        id: id.to_string(),
        cron: cron.to_string(),
        capability: "reports".to_string(),
        operation: "build".to_string(),
        args: serde_json::Value::Null,
        queue: None,
        timezone: "UTC".to_string(),
    }
}

#[test]
fn test_validate_default_config() {
    let config = Config::default();
    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.is_valid());
    assert!(result.warnings.is_empty());
}

#[test]
fn test_validate_invalid_port() {
    let mut config = Config::default();
    config.server.port = 0;

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(!result.is_valid());
    assert!(result.errors.iter().any(|e| e.path == "server.port"));
}

#[test]
fn test_disabled_server_skips_checks() {
    let mut config = Config::default();
    config.server.enabled = false;
    config.server.port = 0;

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.is_valid());
}

#[test]
fn test_memory_backend_warns() {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.is_valid());
    assert!(result.warnings.iter().any(|w| w.path == "storage.backend"));
}

#[test]
fn test_empty_sqlite_path() {
    let mut config = Config::default();
    config.storage.path = "  ".to_string();

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "storage.path"));
}

#[test]
fn test_worker_count_and_queues() {
    let mut config = Config::default();
    config.worker.count = 0;
    config.worker.queues = vec!["critical".to_string(), String::new()];

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "worker.count"));
    assert!(result.errors.iter().any(|e| e.path == "worker.queues"));
}

#[test]
fn test_heartbeat_must_be_shorter_than_lease() {
    let mut config = Config::default();
    config.worker.lease_secs = 30;
    config.worker.heartbeat_secs = Some(30);

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "worker.heartbeat_secs"));

    config.worker.heartbeat_secs = Some(10);
    assert!(ConfigValidator::validate(&config).unwrap().is_valid());
}

#[test]
fn test_zero_lease() {
    let mut config = Config::default();
    config.worker.lease_secs = 0;

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "worker.lease_secs"));
}

#[test]
fn test_scheduler_intervals() {
    let mut config = Config::default();
    config.scheduler.reap_interval_ms = 0;
    config.scheduler.poll_interval_ms = 120_000;

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "scheduler.reap_interval_ms"));
    assert!(result.warnings.iter().any(|w| w.path == "scheduler.poll_interval_ms"));
}

#[test]
fn test_retry_bounds() {
    let mut config = Config::default();
    config.retry.factor = 0.5;
    config.retry.jitter = 1.5;
    config.retry.base_delay_secs = 7200;

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "retry.factor"));
    assert!(result.errors.iter().any(|e| e.path == "retry.jitter"));
    assert!(result.warnings.iter().any(|w| w.path == "retry.base_delay_secs"));
}

#[test]
fn test_recurring_entries() {
    let mut config = Config::default();
    config.recurring = vec![
        recurring("report", "0 2 * * *"),
        recurring("report", "*/5 * * * *"),
        recurring("broken", "not a cron"),
    ];
    let mut bad_zone = recurring("zoned", "0 * * * *");
    bad_zone.timezone = "Mars/Olympus".to_string();
    config.recurring.push(bad_zone);

    let result = ConfigValidator::validate(&config).unwrap();
    let paths: Vec<&str> = result.errors.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["recurring[1].id", "recurring[2].cron", "recurring[3].cron"]);
}

#[test]
fn test_into_result() {
    let mut config = Config::default();
    config.worker.count = 0;

    let err = ConfigValidator::validate(&config).unwrap().into_result().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "worker.count"));

    let warnings = ConfigValidator::validate(&Config::default())
        .unwrap()
        .into_result()
        .unwrap();
    assert!(warnings.is_empty());
}

//! Configuration loader.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConfigError;
use crate::schema::Config;

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a TOML file, or the defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) => Ok(Config::default()),
            other => other,
        }
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        static VAR: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
        let re = VAR
            .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}"))
            .as_ref()
            .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;

        let mut result = content.to_string();
        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.jobmill`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Misfire, StorageBackend};
    use jobmill_protocols::ExhaustedAction;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.worker.count, 4);
    }

    #[test]
    fn test_expand_path() {
        let expanded = ConfigLoader::expand_path("~/.jobmill");
        assert!(!expanded.starts_with('~'));
    }

    #[test]
    fn test_load_full_config() {
        let content = r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [storage]
            backend = "memory"

            [worker]
            count = 8
            queues = ["critical", "default"]
            lease_secs = 60

            [scheduler]
            misfire = "fire_all"

            [retry]
            max_attempts = 3

            [retention]
            exhausted = "delete"
            failed_retention_secs = 86400

            [[recurring]]
            id = "nightly-report"
            cron = "0 2 * * *"
            capability = "reports"
            operation = "build"
            args = { format = "pdf" }
            timezone = "+02:00"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.worker.queues, vec!["critical", "default"]);
        assert_eq!(config.worker.heartbeat_secs(), 20);
        assert_eq!(config.scheduler.misfire, Misfire::FireAll);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retention.exhausted, ExhaustedAction::Delete);
        assert_eq!(config.recurring.len(), 1);
        assert_eq!(config.recurring[0].args["format"], "pdf");
        assert_eq!(config.recurring[0].queue, None);
        assert_eq!(config.recurring[0].timezone, "+02:00");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]").unwrap();
        writeln!(file, "port = 5000").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ConfigLoader::load(Path::new("/nonexistent/path/jobmill.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));

        let config = ConfigLoader::load_or_default(Path::new("/nonexistent/path/jobmill.toml"))
            .unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = ConfigLoader::load_str("invalid = [unclosed");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = ConfigLoader::load_str("[storage]\nbackend = \"redis\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: This test runs in isolation and sets a unique test-only env var
        unsafe {
            std::env::set_var("JOBMILL_TEST_DB_PATH", "/var/lib/jobmill/jobs.db");
        }
        let config =
            ConfigLoader::load_str("[storage]\npath = \"${JOBMILL_TEST_DB_PATH}\"").unwrap();
        assert_eq!(config.storage.path, "/var/lib/jobmill/jobs.db");
        unsafe {
            std::env::remove_var("JOBMILL_TEST_DB_PATH");
        }
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let content = "value = \"${NONEXISTENT_JOBMILL_VAR_12345}\"";
        let result = ConfigLoader::expand_env_vars(content);
        assert!(matches!(result, Err(ConfigError::EnvVarNotSet(_))));
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let content = "value = \"no variables here\"";
        let expanded = ConfigLoader::expand_env_vars(content).unwrap();
        assert_eq!(expanded, content);
    }
}

//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("No config file at {0}")]
    NotFound(String),

    #[error("Malformed config: {0}")]
    InvalidFormat(String),

    /// A value parsed but failed validation.
    #[error("{field}: {message}")]
    InvalidValue { field: String, message: String },

    /// `${VAR}` referenced a variable that is not set.
    #[error("Environment variable {0} is not set")]
    EnvVarNotSet(String),

    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config: {0}")]
    TomlParse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_names_the_field() {
        let err = ConfigError::InvalidValue {
            field: "worker.count".to_string(),
            message: "count must be greater than 0".to_string(),
        };
        assert_eq!(err.to_string(), "worker.count: count must be greater than 0");
    }

    #[test]
    fn test_env_var_not_set_error() {
        let err = ConfigError::EnvVarNotSet("JOBMILL_DB".to_string());
        assert_eq!(err.to_string(), "Environment variable JOBMILL_DB is not set");
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ConfigError::from(io_err);
        assert!(matches!(err, ConfigError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }
}

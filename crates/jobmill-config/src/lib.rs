//! # jobmill Config
//!
//! TOML configuration for the jobmill engine: schema with defaults for every
//! field, a loader with `${VAR}` and `~` expansion, and a validator.

mod error;
mod loader;
mod schema;
mod validator;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationError, ValidationResult, ValidationWarning};

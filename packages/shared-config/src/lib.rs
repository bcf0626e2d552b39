//! Shared configuration types for Resonance services
//!
//! This crate provides common configuration types used by both the API
//! (which enqueues background jobs) and the worker (which runs them),
//! ensuring both sides agree on database and queue settings.

mod database;
mod error;
mod queue;

pub use database::DatabaseConfig;
pub use error::{ConfigError, ConfigResult};
pub use queue::QueueConfig;

use std::env;

/// Common configuration shared between all services
#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Job queue configuration
    pub queue: QueueConfig,

    /// Environment mode (development, staging, production)
    pub environment: Environment,

    /// Log level (from RUST_LOG or LOG_LEVEL)
    pub log_level: String,
}

/// Application environment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        })
    }
}

impl Environment {
    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is a development environment
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl CommonConfig {
    /// Load common configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            queue: QueueConfig::from_env()?,
            environment: env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string())
                .parse()
                .unwrap_or_default(),
            log_level: env::var("RUST_LOG")
                .or_else(|_| env::var("LOG_LEVEL"))
                .unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Helper function to get a required environment variable
pub fn get_required_env(name: &str) -> ConfigResult<String> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

/// Helper function to get an optional environment variable with a default
pub fn get_env_or_default(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Helper function to parse an environment variable into a specific type
pub fn parse_env<T>(name: &str, default: T) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!(
            "prod".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!(
            "staging".parse::<Environment>().unwrap(),
            Environment::Staging
        );
        assert_eq!(
            "anything".parse::<Environment>().unwrap(),
            Environment::Development
        );
    }

    #[test]
    fn test_environment_display() {
        assert_eq!(format!("{}", Environment::Production), "production");
        assert_eq!(format!("{}", Environment::Development), "development");
    }

    #[test]
    fn test_parse_env_default_and_override() {
        temp_env::with_var_unset("RESONANCE_TEST_PARSE_ENV", || {
            assert_eq!(parse_env("RESONANCE_TEST_PARSE_ENV", 7u32).unwrap(), 7);
        });
        temp_env::with_var("RESONANCE_TEST_PARSE_ENV", Some(" 12 "), || {
            assert_eq!(parse_env("RESONANCE_TEST_PARSE_ENV", 7u32).unwrap(), 12);
        });
    }

    #[test]
    fn test_parse_env_invalid_value() {
        temp_env::with_var("RESONANCE_TEST_PARSE_ENV_BAD", Some("-3"), || {
            let result = parse_env("RESONANCE_TEST_PARSE_ENV_BAD", 1u64);
            assert!(matches!(result, Err(ConfigError::InvalidValue(name, _)) if name == "RESONANCE_TEST_PARSE_ENV_BAD"));
        });
    }

    #[test]
    fn test_required_env_missing() {
        temp_env::with_var_unset("RESONANCE_TEST_REQUIRED", || {
            assert!(matches!(
                get_required_env("RESONANCE_TEST_REQUIRED"),
                Err(ConfigError::MissingEnvVar(_))
            ));
        });
    }
}

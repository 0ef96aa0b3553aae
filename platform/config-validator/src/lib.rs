//! Shared helpers for reading and validating environment-sourced config.
//!
//! Every service's `Config::from_env()` is expected to build on these
//! primitives instead of calling `std::env::var` directly, so that a
//! missing or malformed variable always produces the same
//! `ConfigError` shape regardless of which service hit it.

use std::env;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(String),

    #[error("invalid value for environment variable {name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Read a required environment variable.
pub fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name.to_string()))
}

/// Read an optional environment variable, falling back to `default`.
pub fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable, falling back to `default` when unset.
pub fn env_parse_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            name: name.to_string(),
            source: Box::new(e),
        }),
        Err(_) => Ok(default),
    }
}

/// Read and parse a required environment variable.
pub fn require_env_parse<T>(name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = require_env(name)?;
    raw.parse::<T>().map_err(|e| ConfigError::Invalid {
        name: name.to_string(),
        source: Box::new(e),
    })
}

/// Read a comma-separated list from an environment variable.
pub fn env_set_or(name: &str, default: &[&str]) -> Vec<String> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Read a boolean-ish environment variable ("1"/"true" => true).
pub fn env_bool_or(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => {
            let lowered = raw.to_lowercase();
            !(lowered == "0" || lowered == "false" || lowered.is_empty())
        }
        Err(_) => default,
    }
}

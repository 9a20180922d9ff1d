use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub db_readers: usize,
    pub presence_ttl: Duration,
    pub broadcast_interval: Duration,
    pub update_max_attempts: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "COEDIT_BIND_ADDR", "127.0.0.1:8080");
        let database_path =
            PathBuf::from(value_or_default(&lookup, "COEDIT_DATABASE_PATH", "coedit.db"));

        let db_readers = bounded(&lookup, "COEDIT_DB_READERS", 2, 0, 16)?;
        let presence_ttl_secs = bounded(&lookup, "PRESENCE_TTL_SECS", 300, 10, 3_600)?;
        let broadcast_interval_secs =
            bounded(&lookup, "PRESENCE_BROADCAST_INTERVAL_SECS", 5, 1, 60)?;
        let update_max_attempts = bounded(&lookup, "UPDATE_MAX_ATTEMPTS", 3, 1, 10)?;

        Ok(Self {
            bind_addr,
            database_path,
            db_readers: usize::try_from(db_readers).map_err(|_| {
                ConfigError::Invalid("COEDIT_DB_READERS does not fit this platform".to_string())
            })?,
            presence_ttl: Duration::from_secs(presence_ttl_secs),
            broadcast_interval: Duration::from_secs(broadcast_interval_secs),
            update_max_attempts: u32::try_from(update_max_attempts).map_err(|_| {
                ConfigError::Invalid("UPDATE_MAX_ATTEMPTS does not fit in u32".to_string())
            })?,
        })
    }

    /// In-memory configuration for tests and local experiments
    pub fn in_memory() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            database_path: PathBuf::from(":memory:"),
            db_readers: 0,
            presence_ttl: Duration::from_secs(300),
            broadcast_interval: Duration::from_secs(5),
            update_max_attempts: 3,
        }
    }
}

/// Parse an integer variable, falling back to `default` and enforcing
/// `[min, max]`
fn bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

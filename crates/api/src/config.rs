//! Process configuration from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub workers: usize,
    pub poll_interval: Duration,
    /// Postgres store when set; in-memory otherwise
    pub database_url: Option<String>,
    pub temp_dir: PathBuf,
    pub temp_max_age: Duration,
    pub cleanup_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            workers: 2,
            poll_interval: Duration::from_millis(200),
            database_url: None,
            temp_dir: std::env::temp_dir().join("taskforge"),
            temp_max_age: Duration::from_secs(86_400),
            cleanup_interval: Duration::from_secs(86_400),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("TASKFORGE_BIND") {
            cfg.bind = v
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("TASKFORGE_BIND", &v, e.to_string()))?;
        }
        if let Some(v) = lookup("TASKFORGE_WORKERS") {
            let n: usize = parse_number("TASKFORGE_WORKERS", &v)?;
            if !(1..=64).contains(&n) {
                return Err(invalid("TASKFORGE_WORKERS", &v, "must be between 1 and 64"));
            }
            cfg.workers = n;
        }
        if let Some(v) = lookup("TASKFORGE_POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(parse_number("TASKFORGE_POLL_INTERVAL_MS", &v)?);
        }
        cfg.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup("TASKFORGE_TEMP_DIR") {
            if v.trim().is_empty() {
                return Err(invalid("TASKFORGE_TEMP_DIR", &v, "must not be empty"));
            }
            cfg.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKFORGE_TEMP_MAX_AGE_SECS") {
            cfg.temp_max_age = Duration::from_secs(parse_number("TASKFORGE_TEMP_MAX_AGE_SECS", &v)?);
        }
        if let Some(v) = lookup("TASKFORGE_CLEANUP_INTERVAL_SECS") {
            let secs: u64 = parse_number("TASKFORGE_CLEANUP_INTERVAL_SECS", &v)?;
            if secs == 0 {
                return Err(invalid("TASKFORGE_CLEANUP_INTERVAL_SECS", &v, "must be positive"));
            }
            cfg.cleanup_interval = Duration::from_secs(secs);
        }

        Ok(cfg)
    }
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, value, e.to_string()))
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

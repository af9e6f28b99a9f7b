//! Worker configuration

use std::env;

/// Default retention for finished webhook records
pub const DEFAULT_WEBHOOK_RETENTION_DAYS: i32 = 30;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub webhook_retention_days: i32,
    /// Emit JSON logs instead of the human-readable format
    pub log_json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(String),

    #[error("Invalid value for {0}: {1}")]
    Invalid(String, String),
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL".into()))?;

        let database_max_connections = parse_or("DATABASE_MAX_CONNECTIONS", 5)?;
        let webhook_retention_days =
            parse_or("WEBHOOK_RETENTION_DAYS", DEFAULT_WEBHOOK_RETENTION_DAYS)?;
        if webhook_retention_days < 1 {
            return Err(ConfigError::Invalid(
                "WEBHOOK_RETENTION_DAYS".into(),
                "must be at least 1".into(),
            ));
        }

        let log_json = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            database_max_connections,
            webhook_retention_days,
            log_json,
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(key.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

//! Centralized configuration management.
//!
//! All configuration is loaded from environment variables at startup.
//! This provides a single source of truth and fails fast if required config is missing.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub data_service: DataServiceConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

/// Replication service (Rucio-compatible) client configuration
#[derive(Debug, Clone)]
pub struct DataServiceConfig {
    pub base_url: String,
    /// The account the client acts as; rules are owned by this principal.
    pub account: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

/// Per-agent polling configuration. Each agent loads its own copy with a
/// distinct env prefix (`TRANSFORM_AGENT`, `PROCESSING_AGENT`).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// How many due rows one tick claims.
    pub bulk_size: i64,
    /// Cadence of the tick loop.
    pub poll_interval: Duration,
    /// Only claim rows whose `updated_at` is older than this; `None` disables
    /// the filter.
    pub poll_period: Option<Duration>,
    /// Claims older than this are expired by the stale-lock reaper.
    pub lock_expire: Duration,
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// This should be called once at application startup.
    /// It will fail fast if required configuration is missing.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            data_service: DataServiceConfig::from_env()?,
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .context("DB_MAX_CONNECTIONS must be a number")?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("DB_MIN_CONNECTIONS must be a number")?,
            acquire_timeout: Duration::from_secs(
                env::var("DB_ACQUIRE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("DB_ACQUIRE_TIMEOUT_SECS must be a number")?,
            ),
            idle_timeout: Duration::from_secs(
                env::var("DB_IDLE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .context("DB_IDLE_TIMEOUT_SECS must be a number")?,
            ),
            max_lifetime: Duration::from_secs(
                env::var("DB_MAX_LIFETIME_SECS")
                    .unwrap_or_else(|_| "1800".to_string())
                    .parse()
                    .context("DB_MAX_LIFETIME_SECS must be a number")?,
            ),
        })
    }
}

impl DataServiceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: env::var("DATA_SERVICE_URL").context("DATA_SERVICE_URL is required")?,
            account: env::var("DATA_SERVICE_ACCOUNT")
                .context("DATA_SERVICE_ACCOUNT is required")?,
            auth_token: env::var("DATA_SERVICE_AUTH_TOKEN").ok().filter(|s| !s.is_empty()),
            timeout: Duration::from_secs(
                env::var("DATA_SERVICE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("DATA_SERVICE_TIMEOUT_SECS must be a number")?,
            ),
        })
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bulk_size: 20,
            poll_interval: Duration::from_secs(60),
            poll_period: None,
            lock_expire: Duration::from_secs(3600),
        }
    }
}

impl AgentConfig {
    /// Load agent settings from environment variables with the given prefix.
    pub fn from_env_with_prefix(prefix: &str) -> Self {
        let defaults = Self::default();

        let bulk_size = env::var(format!("{}_BULK_SIZE", prefix))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bulk_size);

        let poll_interval_secs = env::var(format!("{}_POLL_INTERVAL_SECS", prefix))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.poll_interval.as_secs());

        let poll_period = env::var(format!("{}_POLL_PERIOD_SECS", prefix))
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);

        let lock_expire_secs = env::var(format!("{}_LOCK_EXPIRE_SECS", prefix))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.lock_expire.as_secs());

        Self {
            bulk_size,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_period,
            lock_expire: Duration::from_secs(lock_expire_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.bulk_size, 20);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(config.poll_period.is_none());
        assert_eq!(config.lock_expire, Duration::from_secs(3600));
    }
}

//! Engine configuration.

use crate::queue::RetryPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Settings for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the remote backend
    pub remote_url: Option<String>,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// Location of the local database
    pub db_path: PathBuf,
    /// Period of the background sync trigger
    pub sync_interval: Duration,
    /// Period of the reachability probe
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before going offline
    pub offline_after: u32,
    /// Entries borrowed per drain round
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            auth_token: None,
            db_path: PathBuf::from("custody.db"),
            sync_interval: Duration::from_secs(300),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_millis(3_000),
            offline_after: 2,
            batch_size: 50,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from `CUSTODY_*` environment variables, falling
    /// back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let parse = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(key).map(|raw| parse_value(key, &raw)).transpose()
        };

        let retry = RetryPolicy {
            base_delay_ms: parse("CUSTODY_RETRY_BASE_MS")?.unwrap_or(defaults.retry.base_delay_ms),
            max_exponent: narrow(
                "CUSTODY_RETRY_CAP",
                parse("CUSTODY_RETRY_CAP")?,
                defaults.retry.max_exponent,
            )?,
            max_attempts: narrow(
                "CUSTODY_MAX_ATTEMPTS",
                parse("CUSTODY_MAX_ATTEMPTS")?,
                defaults.retry.max_attempts,
            )?,
        };

        let config = Self {
            remote_url: lookup("CUSTODY_REMOTE_URL").filter(|v| !v.trim().is_empty()),
            auth_token: lookup("CUSTODY_AUTH_TOKEN").filter(|v| !v.trim().is_empty()),
            db_path: lookup("CUSTODY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            sync_interval: parse("CUSTODY_SYNC_INTERVAL_SECS")?
                .map_or(defaults.sync_interval, Duration::from_secs),
            probe_interval: parse("CUSTODY_PROBE_INTERVAL_SECS")?
                .map_or(defaults.probe_interval, Duration::from_secs),
            probe_timeout: parse("CUSTODY_PROBE_TIMEOUT_MS")?
                .map_or(defaults.probe_timeout, Duration::from_millis),
            offline_after: narrow(
                "CUSTODY_OFFLINE_AFTER",
                parse("CUSTODY_OFFLINE_AFTER")?,
                defaults.offline_after,
            )?,
            batch_size: parse("CUSTODY_BATCH_SIZE")?
                .map(|v| usize::try_from(v).map_err(|_| ConfigError::invalid("CUSTODY_BATCH_SIZE", v)))
                .transpose()?
                .unwrap_or(defaults.batch_size),
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("CUSTODY_BATCH_SIZE", 0));
        }
        if self.offline_after == 0 {
            return Err(ConfigError::invalid("CUSTODY_OFFLINE_AFTER", 0));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("CUSTODY_MAX_ATTEMPTS", 0));
        }
        if self.sync_interval.is_zero() || self.probe_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "CUSTODY_*_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

fn narrow(key: &'static str, value: Option<u64>, default: u32) -> Result<u32, ConfigError> {
    value
        .map(|v| u32::try_from(v).map_err(|_| ConfigError::invalid(key, v)))
        .transpose()
        .map(|v| v.unwrap_or(default))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl ToString) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
        }
    }
}

use crate::backoff::{BackoffPolicy, DEFAULT_BASE_SECONDS, DEFAULT_CAP_SECONDS};
use crate::{Error, Result};
use std::ops::RangeInclusive;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const MAX_ATTEMPTS_RANGE: RangeInclusive<u32> = 1..=20;
pub const RETRY_BASE_SECONDS_RANGE: RangeInclusive<u64> = 5..=300;
/// Longest delay a cap may be configured to (7 days).
pub const MAX_RETRY_CAP_SECONDS: u64 = 7 * 24 * 3_600;

/// Retry budget for the error-recovery ledger.
///
/// Built once at startup and handed to the store constructors. Values are
/// clamped on construction, never rejected.
///
/// Fields are private so every value passes through the clamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    max_attempts: u32,
    retry_base_seconds: u64,
    retry_cap_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_seconds: DEFAULT_BASE_SECONDS,
            retry_cap_seconds: DEFAULT_CAP_SECONDS,
        }
    }
}

impl RecoveryConfig {
    #[tracing::instrument(level = "debug")]
    pub fn new(max_attempts: u32, retry_base_seconds: u64) -> Self {
        Self::default()
            .with_max_attempts(max_attempts)
            .with_retry_base_seconds(retry_base_seconds)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = clamp(max_attempts, MAX_ATTEMPTS_RANGE);
        self
    }

    pub fn with_retry_base_seconds(mut self, retry_base_seconds: u64) -> Self {
        self.retry_base_seconds = clamp(retry_base_seconds, RETRY_BASE_SECONDS_RANGE);
        self.retry_cap_seconds = self.retry_cap_seconds.max(self.retry_base_seconds);
        self
    }

    pub fn with_retry_cap_seconds(mut self, retry_cap_seconds: u64) -> Self {
        self.retry_cap_seconds = retry_cap_seconds
            .max(self.retry_base_seconds)
            .min(MAX_RETRY_CAP_SECONDS);
        self
    }

    /// Read `CONNECTOR_MAX_RETRIES` and `CONNECTOR_RETRY_BASE_SECONDS`.
    ///
    /// Missing or unparsable values fall back to the defaults.
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("CONNECTOR_MAX_RETRIES")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let retry_base_seconds = std::env::var("CONNECTOR_RETRY_BASE_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_BASE_SECONDS);
        Self::new(max_attempts, retry_base_seconds)
    }

    /// Attempt count at which an entry is dead-lettered.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retry_base_seconds(&self) -> u64 {
        self.retry_base_seconds
    }

    pub fn retry_cap_seconds(&self) -> u64 {
        self.retry_cap_seconds
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retry_base_seconds, self.retry_cap_seconds)
    }
}

fn clamp<T: Ord + Copy>(value: T, range: RangeInclusive<T>) -> T {
    value.clamp(*range.start(), *range.end())
}

/// Connection settings for the SQL-backed stores.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `sqlite://path/to/file.db` or `postgres://...`.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_millis(5_000),
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("CONNECTOR_SYNC_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| {
                Error::InvalidInput("CONNECTOR_SYNC_DATABASE_URL is required".to_string())
            })?;
        let max_connections = std::env::var("CONNECTOR_SYNC_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);
        let acquire_timeout_ms = std::env::var("CONNECTOR_SYNC_DB_ACQUIRE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5_000);

        let cfg = Self {
            url,
            max_connections,
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::InvalidInput("database url is empty".to_string()));
        }
        if self.backend().is_none() {
            return Err(Error::InvalidInput(format!(
                "unsupported database url scheme: {}",
                self.url
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidInput(
                "max_connections must be > 0".to_string(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "acquire_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backend(&self) -> Option<StoreBackend> {
        let url = self.url.trim();
        if url.starts_with("sqlite:") {
            Some(StoreBackend::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(StoreBackend::Postgres)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Postgres,
}

//! Configuration types.
//!
//! Every knob has a default matching production behaviour and can be
//! overridden with a `HELPDESK_*` environment variable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pool::PoolConfig;
use crate::retry::RetryConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between sync ticks.
    pub sync_interval: Duration,
    /// Interval between idle-pool sweeps.
    pub pool_cleanup_interval: Duration,
    /// Interval between health-check passes.
    pub health_check_interval: Duration,
    /// Retry state older than this is reaped on every pool sweep.
    pub retry_retention: Duration,
    /// Mailbox scanned for unseen mail.
    pub mailbox: String,
    /// Connection pool and circuit-breaker settings.
    pub pool: PoolConfig,
    /// Backoff policy for establishing connections.
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            pool_cleanup_interval: Duration::from_secs(300), // 5 minutes
            health_check_interval: Duration::from_secs(30),
            retry_retention: Duration::from_secs(3600), // 1 hour
            mailbox: "INBOX".to_string(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let pool_defaults = PoolConfig::default();
        let retry_defaults = RetryConfig::default();

        let jitter_factor: f64 =
            env_parse("HELPDESK_RETRY_JITTER", retry_defaults.jitter_factor)?;
        if !(0.0..1.0).contains(&jitter_factor) {
            return Err(ConfigError::InvalidValue {
                key: "HELPDESK_RETRY_JITTER".into(),
                message: format!("must be in [0, 1), got {jitter_factor}"),
            });
        }

        let backoff_multiplier: f64 =
            env_parse("HELPDESK_RETRY_MULTIPLIER", retry_defaults.backoff_multiplier)?;
        if backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "HELPDESK_RETRY_MULTIPLIER".into(),
                message: format!("must be >= 1, got {backoff_multiplier}"),
            });
        }

        let breaker_threshold: u32 =
            env_parse("HELPDESK_BREAKER_THRESHOLD", pool_defaults.breaker_threshold)?;
        if breaker_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HELPDESK_BREAKER_THRESHOLD".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            sync_interval: env_secs("HELPDESK_SYNC_INTERVAL_SECS", defaults.sync_interval)?,
            pool_cleanup_interval: env_secs(
                "HELPDESK_POOL_CLEANUP_INTERVAL_SECS",
                defaults.pool_cleanup_interval,
            )?,
            health_check_interval: env_secs(
                "HELPDESK_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval,
            )?,
            retry_retention: env_secs("HELPDESK_RETRY_RETENTION_SECS", defaults.retry_retention)?,
            mailbox: std::env::var("HELPDESK_MAILBOX").unwrap_or(defaults.mailbox),
            pool: PoolConfig {
                idle_timeout: env_secs("HELPDESK_IDLE_TIMEOUT_SECS", pool_defaults.idle_timeout)?,
                breaker_threshold,
                breaker_cooldown: env_secs(
                    "HELPDESK_BREAKER_COOLDOWN_SECS",
                    pool_defaults.breaker_cooldown,
                )?,
                ping_timeout: env_secs("HELPDESK_PING_TIMEOUT_SECS", pool_defaults.ping_timeout)?,
            },
            retry: RetryConfig {
                max_retries: env_parse("HELPDESK_RETRY_MAX", retry_defaults.max_retries)?,
                base_delay: env_millis("HELPDESK_RETRY_BASE_MS", retry_defaults.base_delay)?,
                max_delay: env_millis("HELPDESK_RETRY_MAX_DELAY_MS", retry_defaults.max_delay)?,
                backoff_multiplier,
                jitter_factor,
                retryable_errors: retry_defaults.retryable_errors,
            },
        })
    }
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// TCP connect timeout for IMAP sessions.
    pub connect_timeout: Duration,
    /// Read/write timeout for IMAP sessions.
    pub io_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: std::env::var("HELPDESK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/helpdesk.db")),
            log_dir: std::env::var("HELPDESK_LOG_DIR").ok().map(PathBuf::from),
            connect_timeout: env_secs("HELPDESK_CONNECT_TIMEOUT_SECS", Duration::from_secs(30))?,
            io_timeout: env_secs("HELPDESK_IO_TIMEOUT_SECS", Duration::from_secs(30))?,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

//! Runtime configuration, loaded from the environment.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::validate_phone;
use crate::scheduler::SchedulerConfig;

/// Top-level configuration for the companion service.
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    /// Path to the local database file.
    pub db_path: String,
    /// Bind address for the webhook server.
    pub bind_addr: String,
    /// The single care recipient's phone number (E.164).
    pub recipient: String,
    /// Scheduler wakeup interval.
    pub tick_interval: Duration,
    /// How far behind a reminder may be and still fire.
    pub grace_window: chrono::Duration,
    /// Upper bound on one origination attempt.
    pub origination_timeout: Duration,
    /// Opt-in cap on consecutive transient failures before flagging.
    /// Unset means retry without bound.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            db_path: "carecall.db".into(),
            bind_addr: "0.0.0.0:3000".into(),
            recipient: String::new(),
            tick_interval: Duration::from_secs(60),
            grace_window: chrono::Duration::hours(1),
            origination_timeout: Duration::from_secs(30),
            max_consecutive_failures: None,
        }
    }
}

impl CompanionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let recipient = env::var("TARGET_PHONE_NUMBER")
            .map_err(|_| ConfigError::MissingEnvVar("TARGET_PHONE_NUMBER".into()))?;
        validate_phone(&recipient).map_err(|e| ConfigError::InvalidValue {
            key: "TARGET_PHONE_NUMBER".into(),
            message: e.to_string(),
        })?;

        let tick_secs = env_u64("TICK_INTERVAL_SECS", defaults.tick_interval.as_secs())?;
        let grace_secs = env_u64("GRACE_WINDOW_SECS", 3600)?;
        let timeout_secs = env_u64(
            "ORIGINATION_TIMEOUT_SECS",
            defaults.origination_timeout.as_secs(),
        )?;
        let max_failures = env_u64("MAX_CONSECUTIVE_FAILURES", 0)?;

        Ok(Self {
            db_path: env::var("DATABASE_PATH").unwrap_or(defaults.db_path),
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            recipient,
            tick_interval: Duration::from_secs(tick_secs),
            grace_window: chrono::Duration::seconds(grace_secs as i64),
            origination_timeout: Duration::from_secs(timeout_secs),
            max_consecutive_failures: cap_from(max_failures),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: self.tick_interval,
            grace_window: self.grace_window,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

fn cap_from(raw: u64) -> Option<u32> {
    if raw == 0 { None } else { Some(raw as u32) }
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("expected an integer, got {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

//! Error types for CareCall.

use std::time::Duration;

/// Top-level error type for the companion core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub fn validation(reason: impl Into<String>) -> Self {
        StoreError::Validation {
            reason: reason.into(),
        }
    }
}

/// Telephony gateway errors.
///
/// `is_transient()` drives the scheduler's retry decision: transient
/// failures are retried on the next tick, terminal ones flag the reminder.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Target line is busy")]
    Busy,

    #[error("Target did not answer")]
    NoAnswer,

    #[error("Origination timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Invalid target: {target}")]
    InvalidTarget { target: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Whether the failure is worth retrying on a later tick.
    pub fn is_transient(&self) -> bool {
        !matches!(self, GatewayError::InvalidTarget { .. })
    }
}

/// Conversational agent errors (context injection into a live session).
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Session {session_id} is no longer active")]
    SessionClosed { session_id: String },

    #[error("Agent unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for the companion core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(GatewayError::Busy.is_transient());
        assert!(GatewayError::NoAnswer.is_transient());
        assert!(
            GatewayError::Timeout {
                timeout: Duration::from_secs(30)
            }
            .is_transient()
        );
        assert!(GatewayError::Transport("dns".into()).is_transient());
        assert!(
            !GatewayError::InvalidTarget {
                target: "+0".into()
            }
            .is_transient()
        );
    }
}

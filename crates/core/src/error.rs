//! Configuration error model.

use thiserror::Error;

/// Result type for constructors that validate configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration error.
///
/// Raised at construction time and never silently defaulted: an engine that
/// starts has a configuration that was fully understood.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The execution mode is not one of the supported modes.
    #[error("invalid execution mode: {0:?}")]
    InvalidExecutionMode(String),

    /// A cleanup threshold was a literal zero. Use "disabled" instead.
    #[error("{name} must be greater than zero or disabled")]
    ZeroThreshold { name: &'static str },

    /// A cron schedule expression could not be parsed.
    #[error("invalid cron expression for {key:?}: {reason}")]
    InvalidCron { key: String, reason: String },

    /// A queue selector string was malformed.
    #[error("invalid queue selector {0:?}")]
    InvalidQueueSelector(String),

    /// A pause/unpause call must name exactly one of queue, job class or label.
    #[error("pause target must name exactly one of queue, job_class or label")]
    InvalidPauseTarget,

    /// A configuration value could not be interpreted.
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

impl ConfigError {
    pub fn zero_threshold(name: &'static str) -> Self {
        Self::ZeroThreshold { name }
    }

    pub fn invalid_cron(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCron {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_value(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name,
            reason: reason.into(),
        }
    }
}

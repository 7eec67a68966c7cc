//! Custom error types for the application.
//!
//! This module defines the primary error type, `PlmError`, for the application surface:
//! configuration loading, the durable experiment store, and operator commands routed to
//! instruments. Instrument I/O itself never produces a `PlmError` on the polling path;
//! transport faults are contained inside each adapter and turned into fallback readings.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches.
//! - **`Configuration`**: Semantic errors caught by `PlmConfig::validate`.
//! - **`Io`**, **`Csv`**, **`Json`**: Wrapped library errors from the experiment store.
//! - **`InstrumentUnavailable`**: An operator command targeted an adapter that failed to
//!   initialize; the matching control is disabled for the process lifetime.
//! - **`SetpointOutOfRange`**: An operator setpoint outside the configured limits.
//! - **`InvalidCommand`**: Operator input that does not parse into a command.
//! - **`Storage`**: A durable write failed. Distinct from telemetry loss.
//! - **`TaskFailed`**: A background task (scheduler, recorder) panicked or was cancelled.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PlmError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum PlmError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Instrument '{0}' is not initialized")]
    InstrumentUnavailable(String),

    #[error("Setpoint {value} for {target} is outside [{min}, {max}]")]
    SetpointOutOfRange {
        target: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl From<figment::Error> for PlmError {
    fn from(value: figment::Error) -> Self {
        PlmError::Config(Box::new(value))
    }
}

impl PlmError {
    /// Whether the operator can retry after fixing input, as opposed to a fault of the
    /// environment (disk, configuration file).
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self,
            PlmError::SetpointOutOfRange { .. }
                | PlmError::InvalidCommand(_)
                | PlmError::InstrumentUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setpoint_error_names_target_and_range() {
        let err = PlmError::SetpointOutOfRange {
            target: "cathode voltage".into(),
            value: 120.0,
            min: 0.0,
            max: 60.0,
        };
        let message = err.to_string();
        assert!(message.contains("cathode voltage"));
        assert!(message.contains("[0, 60]"));
        assert!(err.is_operator_error());
    }

    #[test]
    fn storage_error_is_not_an_operator_error() {
        let err = PlmError::Storage("disk full".into());
        assert!(!err.is_operator_error());
        assert_eq!(err.to_string(), "Storage error: disk full");
    }

    #[test]
    fn figment_errors_convert() {
        let err: PlmError = figment::Error::from("missing field `acquisition`".to_string()).into();
        match err {
            PlmError::Config(inner) => assert!(inner.to_string().contains("acquisition")),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}

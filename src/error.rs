//! Custom error types for the application.
//!
//! This module defines the primary error type, `IrAlignError`, for the whole rig.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur, from configuration problems to serial transport
//! timeouts and persistence failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax or type mismatches.
//! - **`Configuration`**: Semantic errors in values that parsed fine but make no sense
//!   for the rig (a zero step size, an empty speed list). Caught by `RigConfig::validate`.
//! - **`Io`** / **`Serial`**: Port and file I/O problems.
//! - **`AckTimeout`**: The motion controller did not acknowledge a command in time.
//!   Transient: the scan loop simply retries on its next iteration.
//! - **`PositionReport`**: A position report could not be parsed. Also transient.
//! - **`Persistence`** / **`Csv`**: Writing or reading the sample table failed.
//! - **`CommandRejected`**: An operator command is not valid in the current scan state.
//!
//! By using `#[from]`, `IrAlignError` can be created from the underlying error types,
//! which keeps `?` usable throughout the crate.

use crate::hardware::gcode::ReportParseError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, IrAlignError>;

/// Primary error type for the alignment rig.
#[derive(Error, Debug)]
pub enum IrAlignError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "tokio_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("No acknowledgement for '{command}' (received {received:?})")]
    AckTimeout { command: String, received: String },

    #[error("Position report error: {0}")]
    PositionReport(#[from] ReportParseError),

    #[error("Motion controller error: {0}")]
    Motion(String),

    #[error("Link transport error: {0}")]
    Link(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Command '{command}' rejected while {state}")]
    CommandRejected { command: String, state: String },

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<IrAlignError>),
}

impl From<figment::Error> for IrAlignError {
    fn from(value: figment::Error) -> Self {
        IrAlignError::Config(Box::new(value))
    }
}

impl IrAlignError {
    /// Whether the scan loop may log this error and carry on.
    ///
    /// Transport timeouts, unparseable reports and persistence problems are
    /// recoverable; broken configuration is not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            IrAlignError::Config(_) | IrAlignError::Configuration(_) => false,
            IrAlignError::ShutdownFailed(_) => false,
            #[cfg(feature = "tokio_serial")]
            IrAlignError::Serial(_) => true,
            IrAlignError::Io(_)
            | IrAlignError::AckTimeout { .. }
            | IrAlignError::PositionReport(_)
            | IrAlignError::Motion(_)
            | IrAlignError::Link(_)
            | IrAlignError::Persistence(_)
            | IrAlignError::Csv(_)
            | IrAlignError::CommandRejected { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_timeout_is_recoverable() {
        let err = IrAlignError::AckTimeout {
            command: "M114".into(),
            received: String::new(),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("M114"));
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let err = IrAlignError::Configuration("horizontal_step must be > 0".into());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn parse_error_converts() {
        let err: IrAlignError = ReportParseError::MissingSeparator("X:1.0".into()).into();
        match err {
            IrAlignError::PositionReport(ReportParseError::MissingSeparator(raw)) => {
                assert_eq!(raw, "X:1.0")
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}

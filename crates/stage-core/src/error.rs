//! Custom error types for stage-daq.
//!
//! This module defines the primary error type, `StageError`, shared by the core
//! crate and the controller drivers. Using the `thiserror` crate, it provides a
//! centralized way to describe what can go wrong between the host and a stage
//! controller, from transport problems to protocol timeouts and invalid
//! configuration.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: semantically invalid settings (bad axis count for a
//!   controller type, unknown unit, duplicate axis letters).
//! - **`Io`**: wraps `std::io::Error` coming from the serial transport.
//! - **`NotConnected`**: a command was issued while the transport is closed.
//! - **`Timeout`**: no answer (or no arrival) within the bounded window.
//! - **`Superseded`** / **`Cancelled`**: an outstanding move request was
//!   replaced by a newer target or cancelled by a stop.
//! - **`Protocol`**: the device answered with something that cannot be parsed.
//!
//! Binaries and factories wrap these in `anyhow::Error` with context, the same
//! way the driver crates do.

use thiserror::Error;

/// Convenience alias for results using the stage error type.
pub type AppResult<T> = std::result::Result<T, StageError>;

/// Primary error type for stage-daq.
///
/// # Error Categories
///
/// 1. **Configuration errors** - `Configuration`, `InvalidResolution`,
///    `UnknownAxisFamily`, `UnitMismatch`
///    - Occur while building controllers and axes
///    - Permanent: fix the configuration and retry
///
/// 2. **Transport/protocol errors** - `Io`, `NotConnected`, `Timeout`, `Protocol`
///    - Occur while talking to the controller
///    - Usually local to the controller; the receive path logs and recovers
///
/// 3. **Motion request outcomes** - `Superseded`, `Cancelled`
///    - Returned to the caller awaiting a move
#[derive(Error, Debug)]
pub enum StageError {
    /// Configuration validation failed.
    ///
    /// Occurs when values parse correctly but are logically wrong, e.g. a
    /// single-axis controller configured with two axes.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Serial transport I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The controller transport is not open.
    ///
    /// Returned by every command path when the port is closed instead of
    /// silently dropping the command.
    #[error("Controller '{0}' is not connected")]
    NotConnected(String),

    /// A bounded wait elapsed.
    ///
    /// Used for query/response exchanges and for move-to-target requests
    /// that never observed arrival.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A pending move request was replaced by a newer target on the same axis.
    #[error("Move to {target} superseded by a newer target")]
    Superseded {
        /// Target (encoder counts) of the superseded request
        target: i64,
    },

    /// A pending move request was cancelled (stop issued or controller closed).
    #[error("Move to {target} cancelled")]
    Cancelled {
        /// Target (encoder counts) of the cancelled request
        target: i64,
    },

    /// The device sent something that could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Resolution must be finite and strictly positive.
    #[error("Invalid resolution {0}: must be finite and > 0")]
    InvalidResolution(f64),

    /// A unit was used with an axis of the wrong kind (e.g. degrees on a linear stage).
    #[error("Unit '{unit}' cannot be used with a {kind} axis")]
    UnitMismatch {
        /// Unit symbol
        unit: String,
        /// Axis kind ("linear" or "rotary")
        kind: String,
    },

    /// Model string does not belong to a known axis family.
    #[error("Unknown axis family for model '{0}'")]
    UnknownAxisFamily(String),

    /// Parameter mnemonic is not part of the axis parameter set.
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    /// Axis letter not present on the controller.
    #[error("Axis '{0}' not found")]
    AxisNotFound(String),

    /// Controller not present in the registry.
    #[error("Controller '{0}' not found")]
    ControllerNotFound(String),

    /// Operation requires the controller to be stopped first.
    #[error("Controller '{0}' is running")]
    ControllerRunning(String),
}

impl StageError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StageError::Io(_) | StageError::Timeout(_) | StageError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = StageError::NotConnected("XD-C COM3".into());
        assert_eq!(err.to_string(), "Controller 'XD-C COM3' is not connected");

        let err = StageError::Superseded { target: 42 };
        assert_eq!(err.to_string(), "Move to 42 superseded by a newer target");

        let err = StageError::UnitMismatch {
            unit: "deg".into(),
            kind: "linear".into(),
        };
        assert!(err.to_string().contains("linear"));
    }

    #[test]
    fn test_io_conversion_and_transience() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: StageError = io.into();
        assert!(matches!(err, StageError::Io(_)));
        assert!(err.is_transient());
        assert!(!StageError::Configuration("bad".into()).is_transient());
    }
}

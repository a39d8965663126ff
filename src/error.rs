//! Error types and handling for Galvani
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Galvani operations
pub type Result<T> = std::result::Result<T, GalvaniError>;

/// Main error type for Galvani
#[derive(Debug, Error)]
pub enum GalvaniError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A commanded charge transition failed or was invoked outside its precondition
    #[error("Charge control error: {message}")]
    ChargeControl { message: String },

    /// Sensed voltages are implausible or mutually contradictory
    #[error("System voltage error: {message}")]
    Voltage { message: String },

    /// A relay write failed its read-back verification
    #[error("Relay fault: {message}")]
    Relay { message: String },

    /// Transient hardware I/O errors (ADC busy, bus timeout)
    #[error("Hardware error: {message}")]
    Hardware { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl GalvaniError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        GalvaniError::Config {
            message: message.into(),
        }
    }

    /// Create a new charge-control error
    pub fn charge_control<S: Into<String>>(message: S) -> Self {
        GalvaniError::ChargeControl {
            message: message.into(),
        }
    }

    /// Create a new system-voltage error
    pub fn voltage<S: Into<String>>(message: S) -> Self {
        GalvaniError::Voltage {
            message: message.into(),
        }
    }

    /// Create a new relay fault
    pub fn relay<S: Into<String>>(message: S) -> Self {
        GalvaniError::Relay {
            message: message.into(),
        }
    }

    /// Create a new transient hardware error
    pub fn hardware<S: Into<String>>(message: S) -> Self {
        GalvaniError::Hardware {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        GalvaniError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        GalvaniError::Io {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        GalvaniError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        GalvaniError::Generic {
            message: message.into(),
        }
    }

    /// Whether the process-level restart policy may recover from this error.
    ///
    /// Transient hardware faults (an ADC read returning EBUSY after an
    /// NTP-induced clock jump, a bus timeout) are recovered by opening all
    /// relays and restarting the control loop. Everything else is either
    /// handled inside the loop or fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GalvaniError::Hardware { .. } | GalvaniError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for GalvaniError {
    fn from(err: std::io::Error) -> Self {
        GalvaniError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for GalvaniError {
    fn from(err: serde_yaml::Error) -> Self {
        GalvaniError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GalvaniError {
    fn from(err: serde_json::Error) -> Self {
        GalvaniError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for GalvaniError {
    fn from(err: chrono::ParseError) -> Self {
        GalvaniError::Validation {
            field: "datetime".to_string(),
            message: err.to_string(),
        }
    }
}

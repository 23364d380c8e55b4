//! Error types and handling for Zerofeed
//!
//! This module defines the error taxonomy shared by the control loop and its
//! device collaborators. Communication errors are transient and scoped to a
//! single meter or inverter call, command errors abort one inverter's step,
//! acknowledgment timeouts only flip ack flags, and configuration errors are
//! fatal at startup.

use thiserror::Error;

/// Result type alias for Zerofeed operations
pub type Result<T> = std::result::Result<T, ZeroFeedError>;

/// Main error type for Zerofeed
#[derive(Debug, Error)]
pub enum ZeroFeedError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Transport or protocol failure talking to a meter or DTU
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// A set-limit or power command was rejected outright
    #[error("Command error: {message}")]
    Command { message: String },

    /// Device did not confirm a command in time
    #[error("Acknowledgment timeout: {message}")]
    AcknowledgmentTimeout { message: String },

    /// Modbus communication errors
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Endpoint answered with a non-success HTTP status
    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl ZeroFeedError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        ZeroFeedError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new communication error
    pub fn communication<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::Communication {
            message: message.into(),
        }
    }

    /// Create a new command error
    pub fn command<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::Command {
            message: message.into(),
        }
    }

    /// Create a new acknowledgment timeout error
    pub fn ack_timeout<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::AcknowledgmentTimeout {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::Modbus {
            message: message.into(),
        }
    }

    /// Create a new HTTP status error
    pub fn http_status<S: Into<String>>(status: u16, message: S) -> Self {
        ZeroFeedError::HttpStatus {
            status,
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ZeroFeedError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::Network {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::Io {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        ZeroFeedError::Generic {
            message: message.into(),
        }
    }

    /// Whether the error is scoped to a single device call and worth retrying
    /// on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ZeroFeedError::Communication { .. }
                | ZeroFeedError::Modbus { .. }
                | ZeroFeedError::Network { .. }
                | ZeroFeedError::Timeout { .. }
                | ZeroFeedError::AcknowledgmentTimeout { .. }
        )
    }
}

impl From<std::io::Error> for ZeroFeedError {
    fn from(err: std::io::Error) -> Self {
        ZeroFeedError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for ZeroFeedError {
    fn from(err: serde_yaml::Error) -> Self {
        ZeroFeedError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ZeroFeedError {
    fn from(err: serde_json::Error) -> Self {
        ZeroFeedError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ZeroFeedError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            ZeroFeedError::http_status(status.as_u16(), err.to_string())
        } else if err.is_timeout() {
            ZeroFeedError::timeout(err.to_string())
        } else if err.is_decode() {
            ZeroFeedError::communication(format!("Invalid response body: {}", err))
        } else {
            ZeroFeedError::network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ZeroFeedError::config("test config error");
        assert!(matches!(err, ZeroFeedError::Config { .. }));

        let err = ZeroFeedError::command("rejected");
        assert!(matches!(err, ZeroFeedError::Command { .. }));

        let err = ZeroFeedError::validation("field", "test validation error");
        assert!(matches!(err, ZeroFeedError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = ZeroFeedError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = ZeroFeedError::validation("inverters[0].max_watt", "Must be positive");
        assert_eq!(
            format!("{}", err),
            "Validation error: inverters[0].max_watt - Must be positive"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(ZeroFeedError::communication("x").is_transient());
        assert!(ZeroFeedError::timeout("x").is_transient());
        assert!(!ZeroFeedError::command("x").is_transient());
        assert!(!ZeroFeedError::config("x").is_transient());
        // retried by status list, not by kind
        assert!(!ZeroFeedError::http_status(503, "x").is_transient());
        assert_eq!(ZeroFeedError::http_status(503, "x").status_code(), Some(503));
        assert_eq!(ZeroFeedError::network("x").status_code(), None);
    }
}

//! Error types and handling for the synchronization core
//!
//! Client-input rejections are normally carried as [`GateOutcome`] values on the
//! write path; the `RejectedClientChange` variant exists for callers that prefer
//! to propagate them with `?`.
//!
//! [`GateOutcome`]: crate::security::GateOutcome

use crate::security::Rejection;
use std::time::Duration;
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the synchronization core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A client tried to write a property or run a handler that a gate rule blocks
    #[error("Client change rejected: {0}")]
    RejectedClientChange(Rejection),

    /// Out-of-range or unsupported structural operation (caller bug)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Serializing changes kept producing new changes past the configured cap
    #[error("Serialization cycle exceeded after {rounds} extra rounds, {dropped} changes dropped")]
    SerializationCycleExceeded {
        /// Extra rounds that were run before giving up
        rounds: usize,
        /// Number of pending changes discarded for this flush cycle
        dropped: usize,
    },

    /// The transport has no live connection
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A pending round-trip call was cancelled before a reply arrived
    #[error("Remote call cancelled: {0}")]
    Cancelled(String),

    /// A pending round-trip call did not get a reply in time
    #[error("Remote call timed out after {0:?}")]
    TimedOut(Duration),

    /// The client answered a round-trip call with an exception
    #[error("Remote call failed: {0}")]
    RemoteFailure(String),

    /// Wire value could not be converted to or from the in-memory representation
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The event dispatcher is gone or refused a task
    #[error("Dispatcher error: {0}")]
    Dispatcher(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a transport unavailable error
    pub fn transport_unavailable(msg: impl Into<String>) -> Self {
        Self::TransportUnavailable(msg.into())
    }

    /// Create a conversion error
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create a dispatcher error
    pub fn dispatcher(msg: impl Into<String>) -> Self {
        Self::Dispatcher(msg.into())
    }

    /// Check if this error was caused by client input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::RejectedClientChange(_) | Error::Conversion(_) | Error::NotFound(_)
        )
    }

    /// Check if the session can simply carry on after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RejectedClientChange(_)
                | Error::SerializationCycleExceeded { .. }
                | Error::TransportUnavailable(_)
                | Error::Cancelled(_)
                | Error::TimedOut(_)
                | Error::RemoteFailure(_)
                | Error::Conversion(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_errors_are_distinct() {
        let errors = [
            Error::transport_unavailable("closed"),
            Error::Cancelled("window disposed".into()),
            Error::TimedOut(Duration::from_secs(1)),
        ];

        assert!(matches!(errors[0], Error::TransportUnavailable(_)));
        assert!(matches!(errors[1], Error::Cancelled(_)));
        assert!(matches!(errors[2], Error::TimedOut(_)));
        assert!(errors.iter().all(Error::is_recoverable));
    }

    #[test]
    fn test_invalid_operation_is_not_recoverable() {
        let err = Error::invalid_operation("index 7 out of range");
        assert!(!err.is_recoverable());
        assert!(!err.is_client_error());
        assert_eq!(err.to_string(), "Invalid operation: index 7 out of range");
    }
}

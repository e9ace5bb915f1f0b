//! Error types for resilience primitives

use thiserror::Error;

/// Result type for resilience operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the primitives themselves
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Circuit breaker rejected the call without invoking it
    #[error("Circuit breaker open for {dependency}: retry in {retry_in_ms}ms")]
    CircuitOpen {
        /// Dependency name
        dependency: String,
        /// Remaining cool-down
        retry_in_ms: u64,
    },

    /// A single attempt exceeded its time budget
    #[error("Attempt against {dependency} timed out after {timeout_ms}ms")]
    Timeout {
        /// Dependency name
        dependency: String,
        /// Attempt timeout
        timeout_ms: u64,
    },

    /// Policy parameters are inconsistent
    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),
}

/// How a failure should be treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Structural/validation failure: never retried
    Permanent,
    /// Timeout, unavailable, connection, circuit open: retried per policy
    Transient,
    /// Unknown failure: retried, but under a lower attempt cap
    Unclassified,
}

/// Errors that can tell the retry loop how to treat them
pub trait Classify {
    /// Failure class of this error
    fn failure_class(&self) -> FailureClass;
}

impl Classify for Error {
    fn failure_class(&self) -> FailureClass {
        match self {
            Error::CircuitOpen { .. } | Error::Timeout { .. } => FailureClass::Transient,
            Error::InvalidPolicy(_) => FailureClass::Permanent,
        }
    }
}

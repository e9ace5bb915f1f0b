//! Error types for the compliance pipeline

use chrono::{DateTime, Utc};
use resilience::{Classify, FailureClass};
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Malformed or missing event fields
    #[error("Validation error: {0}")]
    Validation(String),

    /// Downstream call exceeded its time budget
    #[error("Timeout calling {dependency} after {timeout_ms}ms")]
    Timeout {
        /// Dependency name
        dependency: String,
        /// Attempt timeout
        timeout_ms: u64,
    },

    /// Downstream reported itself unavailable
    #[error("Downstream unavailable: {0}")]
    Unavailable(String),

    /// Connection-level failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Circuit breaker fast-failed the call
    #[error("Circuit open for {dependency}, retry in {retry_in_ms}ms")]
    CircuitOpen {
        /// Dependency name
        dependency: String,
        /// Remaining cool-down
        retry_in_ms: u64,
    },

    /// Any other downstream failure
    #[error("Downstream error: {0}")]
    Downstream(String),

    /// SLA deadline not in the future
    #[error("Invalid SLA deadline {deadline} for event {event_id}")]
    InvalidDeadline {
        /// Event ID
        event_id: String,
        /// Rejected deadline
        deadline: DateTime<Utc>,
    },

    /// No SLA entry for the event
    #[error("No SLA tracked for event {0}")]
    SlaNotFound(String),

    /// Failure while handling an event classified CRITICAL
    #[error("Critical compliance failure for event {event_id}: {reason}")]
    CriticalCompliance {
        /// Event ID
        event_id: String,
        /// Underlying failure
        reason: String,
    },

    /// Audit/dead-letter/notification sink failed
    #[error("Sink error: {0}")]
    Sink(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Short label used in audit records and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Unavailable(_) => "unavailable",
            PipelineError::Connection(_) => "connection",
            PipelineError::CircuitOpen { .. } => "circuit_open",
            PipelineError::Downstream(_) => "downstream",
            PipelineError::InvalidDeadline { .. } => "invalid_deadline",
            PipelineError::SlaNotFound(_) => "sla_not_found",
            PipelineError::CriticalCompliance { .. } => "critical_compliance",
            PipelineError::Sink(_) => "sink",
            PipelineError::Config(_) => "config",
        }
    }
}

impl Classify for PipelineError {
    fn failure_class(&self) -> FailureClass {
        match self {
            PipelineError::Validation(_)
            | PipelineError::InvalidDeadline { .. }
            | PipelineError::Config(_) => FailureClass::Permanent,
            PipelineError::Timeout { .. }
            | PipelineError::Unavailable(_)
            | PipelineError::Connection(_)
            | PipelineError::CircuitOpen { .. } => FailureClass::Transient,
            PipelineError::Downstream(_)
            | PipelineError::SlaNotFound(_)
            | PipelineError::CriticalCompliance { .. }
            | PipelineError::Sink(_) => FailureClass::Unclassified,
        }
    }
}

impl From<resilience::Error> for PipelineError {
    fn from(err: resilience::Error) -> Self {
        match err {
            resilience::Error::CircuitOpen {
                dependency,
                retry_in_ms,
            } => PipelineError::CircuitOpen {
                dependency,
                retry_in_ms,
            },
            resilience::Error::Timeout {
                dependency,
                timeout_ms,
            } => PipelineError::Timeout {
                dependency,
                timeout_ms,
            },
            resilience::Error::InvalidPolicy(msg) => PipelineError::Config(msg),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Validation(format!("Malformed event envelope: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert_eq!(
            PipelineError::Validation("missing subjectId".into()).failure_class(),
            FailureClass::Permanent
        );
        assert_eq!(
            PipelineError::Unavailable("sanctions-service".into()).failure_class(),
            FailureClass::Transient
        );
        assert_eq!(
            PipelineError::Downstream("HTTP 500".into()).failure_class(),
            FailureClass::Unclassified
        );
    }

    #[test]
    fn test_breaker_errors_map_to_transient() {
        let err: PipelineError = resilience::Error::CircuitOpen {
            dependency: "kyc".into(),
            retry_in_ms: 100,
        }
        .into();
        assert_eq!(err.failure_class(), FailureClass::Transient);
        assert_eq!(err.kind(), "circuit_open");
    }
}

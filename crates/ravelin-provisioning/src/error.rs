//! Engine error taxonomy.
//!
//! Only fatal variants abort a session before any record is processed;
//! record- and task-scoped failures are recovered into report entries and
//! never propagate out of a run.

use thiserror::Error;

use ravelin_connector::error::ConnectorError;

/// Error raised by the reconciliation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rule set or session configuration is invalid. Fatal: detected at
    /// session start, before any record is processed.
    #[error("invalid configuration: {message}")]
    FatalConfig { message: String },

    /// The primary resource connector is missing or unreachable at session
    /// start. Fatal.
    #[error("primary resource connector unavailable: {message}")]
    FatalConnector { message: String },

    /// Matching, rule application or local-state mutation failed for one
    /// record. Recovered into a FAILURE report entry.
    #[error("record processing failed: {message}")]
    RecordFailed { message: String },

    /// Correlation lookup failed for one record.
    #[error("correlation failed: {message}")]
    CorrelationFailed { message: String },

    /// Identity store operation failed.
    #[error("identity store error: {message}")]
    Store { message: String },

    /// A propagation task exhausted its retries against one resource.
    #[error("propagation to {resource} failed: {message}")]
    Propagation { resource: String, message: String },

    /// The session was cancelled before this work was scheduled.
    #[error("session cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether this error aborts the whole session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::FatalConfig { .. } | EngineError::FatalConnector { .. }
        )
    }

    /// Create a fatal configuration error.
    pub fn fatal_config(message: impl Into<String>) -> Self {
        EngineError::FatalConfig {
            message: message.into(),
        }
    }

    /// Create a fatal connector error.
    pub fn fatal_connector(message: impl Into<String>) -> Self {
        EngineError::FatalConnector {
            message: message.into(),
        }
    }

    /// Create a record-scoped failure.
    pub fn record(message: impl Into<String>) -> Self {
        EngineError::RecordFailed {
            message: message.into(),
        }
    }

    /// Create a correlation failure.
    pub fn correlation(message: impl Into<String>) -> Self {
        EngineError::CorrelationFailed {
            message: message.into(),
        }
    }

    /// Create an identity store failure.
    pub fn store(message: impl Into<String>) -> Self {
        EngineError::Store {
            message: message.into(),
        }
    }

    /// Create a task-scoped propagation failure.
    pub fn propagation(resource: impl Into<String>, source: &ConnectorError) -> Self {
        EngineError::Propagation {
            resource: resource.into(),
            message: source.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::fatal_config("bad rules").is_fatal());
        assert!(EngineError::fatal_connector("unreachable").is_fatal());
        assert!(!EngineError::record("oops").is_fatal());
        assert!(!EngineError::Cancelled.is_fatal());
    }

    #[test]
    fn test_propagation_message() {
        let err = EngineError::propagation(
            "ldap-primary",
            &ConnectorError::unavailable("maintenance window"),
        );
        assert!(err.to_string().contains("ldap-primary"));
        assert!(err.to_string().contains("maintenance window"));
    }
}

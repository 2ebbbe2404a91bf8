// Error types for pool management and query execution

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// How the driver classified a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The backend session was reset, closed, or hit end-of-file
    BrokenSession,
    /// The pool was exhausted and the acquire queue timed out
    AcquireTimeout,
    /// Bad SQL, permissions, missing objects and everything else
    Other,
}

/// A failure reported by the database driver, with backend diagnostics
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// Backend error code (SQLSTATE for Postgres)
    pub code: Option<String>,
    /// Driver-specific error number, when the backend reports one
    pub number: Option<i64>,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            number: None,
            message: message.into(),
        }
    }

    pub fn broken_session(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::BrokenSession, message)
    }

    pub fn acquire_timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::AcquireTimeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_number(mut self, number: i64) -> Self {
        self.number = Some(number);
        self
    }

    pub fn is_broken_session(&self) -> bool {
        self.kind == DriverErrorKind::BrokenSession
    }
}

/// Which acquisition path gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStage {
    Pooled,
    Direct,
}

impl fmt::Display for AcquireStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireStage::Pooled => write!(f, "pooled acquisition"),
            AcquireStage::Direct => write!(f, "direct connection fallback"),
        }
    }
}

/// Error types surfaced by the pool manager and the query executor
#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// Required connection settings are missing; never retried
    #[error("Database configuration error: {0}")]
    Configuration(String),

    /// The backend dropped the session; retried with pool recreation
    #[error("Database session broken: {0}")]
    BrokenSession(DriverError),

    /// The pool stayed exhausted for the whole acquire-queue timeout
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    /// Any other backend error, propagated without retry
    #[error("Database error: {0}")]
    Driver(DriverError),

    /// Retries and the direct fallback are exhausted
    #[error("Database connection failed during {stage}: {source}")]
    ConnectionFailed {
        stage: AcquireStage,
        source: DriverError,
    },
}

impl DbError {
    pub fn is_broken_session(&self) -> bool {
        matches!(self, DbError::BrokenSession(_))
    }

    /// Whether the failure means the database could not be reached at all
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            DbError::Configuration(_)
                | DbError::BrokenSession(_)
                | DbError::AcquireTimeout(_)
                | DbError::ConnectionFailed { .. }
        )
    }

    /// Backend diagnostics carried by the error, if any
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            DbError::BrokenSession(err) | DbError::Driver(err) => Some(err),
            DbError::ConnectionFailed { source, .. } => Some(source),
            DbError::Configuration(_) | DbError::AcquireTimeout(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(DbError::Configuration("missing".into()).is_unavailable());
        assert!(DbError::AcquireTimeout(Duration::from_secs(1)).is_unavailable());
        assert!(DbError::BrokenSession(DriverError::broken_session("reset")).is_unavailable());
        assert!(!DbError::Driver(DriverError::other("syntax error")).is_unavailable());
    }

    #[test]
    fn test_connection_failed_names_stage() {
        let err = DbError::ConnectionFailed {
            stage: AcquireStage::Direct,
            source: DriverError::broken_session("connection refused"),
        };
        let message = err.to_string();
        assert!(message.contains("direct connection fallback"));
        assert!(message.contains("connection refused"));
    }

    #[test]
    fn test_driver_error_diagnostics() {
        let err = DbError::Driver(
            DriverError::other("relation \"kpi\" does not exist")
                .with_code("42P01")
                .with_number(7),
        );
        let diag = err.driver_error().expect("driver diagnostics");
        assert_eq!(diag.code.as_deref(), Some("42P01"));
        assert_eq!(diag.number, Some(7));
    }
}

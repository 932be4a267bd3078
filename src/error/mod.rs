use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating resilience settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Category of a failure, attached by callers at the boundary of a wrapped operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection reset, broker unavailable and similar short-lived faults
    Transient,
    /// The dependency did not answer in time
    Timeout,
    /// Deadlocks, failovers and other recoverable database faults
    DatabaseTransient,
    /// Input rejected by the dependency
    Validation,
    /// Any failure that will not go away on its own
    Permanent,
    /// Rejected by an open circuit breaker
    CircuitOpen,
    /// Caller cancelled the operation
    Cancelled,
}

impl ErrorKind {
    /// Default retry classification: transient network, timeout and database faults
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::DatabaseTransient
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "Transient"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::DatabaseTransient => write!(f, "DatabaseTransient"),
            ErrorKind::Validation => write!(f, "Validation"),
            ErrorKind::Permanent => write!(f, "Permanent"),
            ErrorKind::CircuitOpen => write!(f, "CircuitOpen"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Errors that can be classified for retry decisions
pub trait Classify: std::error::Error {
    fn kind(&self) -> ErrorKind;
}

/// Error returned by circuit breakers and retry executors
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// Breaker is open; the operation was not invoked
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    /// The wrapped operation failed; displayed exactly as the original error
    Operation(E),

    /// Retries ran out; carries the last observed error
    RetryExhausted {
        dependency: String,
        attempts: u32,
        last_error: Box<ResilienceError<E>>,
    },

    /// Cancelled by the caller during an attempt or between attempts
    Cancelled { dependency: String },
}

impl<E: std::fmt::Display> std::fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResilienceError::CircuitOpen {
                dependency,
                retry_after,
            } => write!(
                f,
                "Circuit breaker for '{}' is open, retry after {:?}",
                dependency, retry_after
            ),
            ResilienceError::Operation(e) => std::fmt::Display::fmt(e, f),
            ResilienceError::RetryExhausted {
                dependency,
                attempts,
                last_error,
            } => write!(
                f,
                "Retries exhausted for '{}' after {} attempts: {}",
                dependency, attempts, last_error
            ),
            ResilienceError::Cancelled { dependency } => {
                write!(f, "Operation on '{}' was cancelled", dependency)
            }
        }
    }
}

// Derived bounds would recurse through the boxed `RetryExhausted` source.
impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResilienceError::Operation(e) => e.source(),
            ResilienceError::RetryExhausted { last_error, .. } => Some(last_error.as_ref()),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        match self {
            ResilienceError::CircuitOpen { .. } => true,
            ResilienceError::RetryExhausted { last_error, .. } => last_error.is_circuit_open(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::Cancelled { .. })
    }

    /// The operation's own error, looking through `RetryExhausted`
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetryExhausted { last_error, .. } => last_error.operation_error(),
            _ => None,
        }
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetryExhausted { last_error, .. } => last_error.into_operation_error(),
            _ => None,
        }
    }
}

impl<E: Classify> ResilienceError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::Operation(e) => e.kind(),
            ResilienceError::RetryExhausted { last_error, .. } => last_error.kind(),
            ResilienceError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

impl<E> Classify for ResilienceError<E>
where
    E: Classify + 'static,
{
    fn kind(&self) -> ErrorKind {
        ResilienceError::kind(self)
    }
}

//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    /// The OS reported an error launching a child process. Surfaced
    /// synchronously to the exec caller; the child is freed.
    #[error("Launch error: {0}")]
    Launch(String),

    /// A pipe read/write timed out or ran against a detached endpoint.
    /// Surfaced to the in-progress I/O caller.
    #[error("Pipe I/O timed out")]
    PipeTimeout,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Launch(_) => "PSIT001",
            CoreError::PipeTimeout => "PSIT002",
            CoreError::ConfigurationError(_) => "PSIT003",
            CoreError::ValidationError(_) => "PSIT004",
            CoreError::InitializationError(_) => "PSIT005",
            CoreError::Io(_) => "PSIT006",
        }
    }

    /// Whether this is a timeout-class error (expired or detached pipe I/O)
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::PipeTimeout)
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::Launch("x".to_string()).code(), "PSIT001");
        assert_eq!(CoreError::PipeTimeout.code(), "PSIT002");
        assert_eq!(
            CoreError::ConfigurationError("x".to_string()).code(),
            "PSIT003"
        );
        assert_eq!(CoreError::ValidationError("x".to_string()).code(), "PSIT004");
    }

    #[test]
    fn test_error_display() {
        let error = CoreError::Launch("no such file".to_string());
        assert_eq!(error.to_string(), "Launch error: no such file");
        assert_eq!(CoreError::PipeTimeout.to_string(), "Pipe I/O timed out");
    }

    #[test]
    fn test_timeout_classification() {
        assert!(CoreError::PipeTimeout.is_timeout());
        assert!(!CoreError::Launch("x".to_string()).is_timeout());
        let io: CoreError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(!io.is_timeout());
    }
}

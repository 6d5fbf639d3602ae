//! Error types for the instrumentation layer.

use thiserror::Error;

/// Main error type for session, query and scheduling operations.
#[derive(Debug, Error)]
pub enum SpyError {
    #[error("An interception session is already active")]
    SessionConflict,

    #[error("Expression error at {position}: {message} (in `{expression}`)")]
    Expression {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("Missing plugin dependency: {0}")]
    MissingDependency(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl SpyError {
    /// Builds an expression error for `expression` at byte `position`.
    pub fn expression(expression: &str, position: usize, message: impl Into<String>) -> Self {
        SpyError::Expression {
            expression: expression.to_string(),
            position,
            message: message.into(),
        }
    }

    /// Returns true if this error came from compiling a predicate or order-by.
    pub fn is_expression(&self) -> bool {
        matches!(self, SpyError::Expression { .. })
    }
}

/// Result type for instrumentation operations.
pub type Result<T> = std::result::Result<T, SpyError>;

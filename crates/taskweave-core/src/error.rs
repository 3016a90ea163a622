// Error types for the engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while defining or driving workflow executions
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad workflow input or invalid policy/spec values
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate entry for a unique key
    #[error("Duplicate entry: {0}")]
    Conflict(String),

    /// Forbidden state transition or operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A long JSON field exceeded the configured size limit
    #[error("Size limit exceeded for field '{field}': {size_kb}KB > {limit_kb}KB")]
    SizeLimitExceeded {
        field: String,
        size_kb: i64,
        limit_kb: i64,
    },

    /// Workflow definition could not be parsed
    #[error("Failed to parse workflow definition: {0}")]
    DslParse(String),

    /// Expression evaluation error
    #[error("Expression error: {0}")]
    Expression(String),

    /// An action executor reported a failure
    #[error("Action failure: {0}")]
    ActionFailure(String),

    /// Transient database error (retried internally before surfacing)
    #[error("Database error: {0}")]
    Db(String),
}

impl EngineError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    pub fn dsl(msg: impl Into<String>) -> Self {
        EngineError::DslParse(msg.into())
    }

    pub fn expression(msg: impl Into<String>) -> Self {
        EngineError::Expression(msg.into())
    }

    pub fn db(msg: impl Into<String>) -> Self {
        EngineError::Db(msg.into())
    }

    /// Whether a bounded retry inside the engine may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Db(_))
    }
}

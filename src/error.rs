use thiserror::Error;

/// Convenience type alias for Results with AdtError
pub type Result<T> = std::result::Result<T, AdtError>;

/// Main error type for the ADT command center
///
/// Variants map onto the HTTP status codes surfaced at the gateway
/// boundary; see `api::error_response` for the mapping.
#[derive(Error, Debug)]
pub enum AdtError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Process error: {message}")]
    Process { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

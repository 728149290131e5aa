use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,
}

impl MatchError {
    /// Whether the caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MatchError::Unavailable(_) | MatchError::Timeout(_) | MatchError::Network(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MatchError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for MatchError {
    fn from(e: bincode::error::EncodeError) -> Self {
        MatchError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for MatchError {
    fn from(e: bincode::error::DecodeError) -> Self {
        MatchError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MatchError {
    fn from(e: serde_json::Error) -> Self {
        MatchError::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MatchError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MatchError::Timeout("deadline exceeded".to_string())
    }
}

//! Error types for the message API collaborator

use thiserror::Error;

/// Errors returned by a [`MessageApi`](crate::MessageApi) implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Malformed page: {0}")]
    MalformedPage(String),
}

impl ApiError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::SessionNotFound(_) | ApiError::MalformedPage(_) => false,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::MalformedPage(e.to_string())
    }
}

/// Result type for message API calls
pub type ApiResult<T> = Result<T, ApiError>;

//! Error types for transcript-cache
//!
//! None of these escape the public engine operations; they are mapped to
//! outcome values and logged. They exist so internal steps can use `?`.

use thiserror::Error;
use transcript_core::{ApiError, Ordinal};

/// Errors that can occur inside the cache engine
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend call failed
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// A page would leave a gap in the window
    #[error("discontiguous page: expected ordinal {expected}, found {found}")]
    Discontiguous { expected: Ordinal, found: Ordinal },

    /// The session or generation changed while the step was suspended
    #[error("superseded by newer work")]
    Superseded,

    /// Invalid cache configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether this is the silent outcome of superseded work rather than a failure
    pub fn is_superseded(&self) -> bool {
        matches!(self, CacheError::Superseded)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Config(e.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

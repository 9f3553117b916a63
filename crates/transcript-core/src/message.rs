//! Session and message types
//!
//! A session transcript is an append-mostly log. Every entry carries a dense,
//! zero-based [`Ordinal`] that is the only key the cache uses for ordering
//! and addressing; message content is opaque to it.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Dense, zero-based, per-session sequence number of a message
pub type Ordinal = u64;

/// Opaque identifier of a session transcript
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single entry of a session transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Owning session
    pub session_id: SessionId,
    /// Position within the session
    pub ordinal: Ordinal,
    /// When the message was recorded
    pub timestamp: DateTime<Utc>,
    /// Author role (user, assistant, tool, ...)
    pub role: String,
    /// Message body
    pub content: String,
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(
        session_id: SessionId,
        ordinal: Ordinal,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            ordinal,
            timestamp: Utc::now(),
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Authoritative session metadata as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    /// Total number of messages; absent counts are treated as zero
    #[serde(default)]
    pub message_count: Option<u64>,
}

impl SessionMeta {
    pub fn new(id: SessionId, message_count: u64) -> Self {
        Self {
            id,
            message_count: Some(message_count),
        }
    }

    /// Reported count, with a missing value read as an empty session
    pub fn count(&self) -> u64 {
        self.message_count.unwrap_or(0)
    }
}

/// Check that `messages` holds strictly increasing ordinals with no gaps.
///
/// An empty slice is trivially contiguous.
pub fn is_contiguous(messages: &[Message]) -> bool {
    messages
        .windows(2)
        .all(|pair| pair[1].ordinal == pair[0].ordinal + 1)
}

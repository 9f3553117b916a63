//! Message API collaborator abstraction
//!
//! The [`MessageApi`] trait is the only way the cache reaches the backend.
//! It mirrors the backend's paged-fetch contract:
//!
//! ```text
//! fetch(session, { from?, limit, direction }) -> { messages }
//! session(session) -> { message_count, .. }
//! ```
//!
//! ## Implementations
//!
//! - [`MockMessageApi`](crate::MockMessageApi): In-memory log for testing
//! - An HTTP client in the viewer application (not part of this workspace)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::message::{Message, Ordinal, SessionId, SessionMeta};

/// Paging direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Oldest first, starting at `from` (or ordinal 0)
    #[default]
    Asc,
    /// Newest first, starting at `from` (or the newest message)
    Desc,
}

/// A single paged-fetch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Inclusive starting ordinal; `None` starts at the natural end for `direction`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Ordinal>,
    /// Maximum number of messages to return
    pub limit: usize,
    pub direction: Direction,
}

impl FetchOptions {
    /// The newest `limit` messages, newest first
    pub fn latest(limit: usize) -> Self {
        Self {
            from: None,
            limit,
            direction: Direction::Desc,
        }
    }

    /// Up to `limit` messages ascending from `from`
    pub fn ascending(from: Ordinal, limit: usize) -> Self {
        Self {
            from: Some(from),
            limit,
            direction: Direction::Asc,
        }
    }

    /// Up to `limit` messages descending from `from`
    pub fn descending(from: Ordinal, limit: usize) -> Self {
        Self {
            from: Some(from),
            limit,
            direction: Direction::Desc,
        }
    }
}

/// One page of messages, ordered as requested
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
}

impl MessagePage {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Consume the page and return its messages in ascending ordinal order
    ///
    /// `direction` must be the direction the page was fetched with.
    pub fn into_ascending(self, direction: Direction) -> Vec<Message> {
        let mut messages = self.messages;
        if direction == Direction::Desc {
            messages.reverse();
        }
        messages
    }
}

/// Paged access to a remote session log
///
/// Implementations must be cheap to call concurrently; the cache may have a
/// background prefetch and an interactive fetch outstanding at the same time.
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Fetch one page of a session's messages
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success response.
    async fn fetch(&self, session: &SessionId, options: FetchOptions) -> ApiResult<MessagePage>;

    /// Fetch authoritative session metadata, including the current message count
    async fn session(&self, session: &SessionId) -> ApiResult<SessionMeta>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_options_wire_format() {
        let json = serde_json::to_value(FetchOptions::latest(1000)).unwrap();
        assert_eq!(json, serde_json::json!({ "limit": 1000, "direction": "desc" }));

        let json = serde_json::to_value(FetchOptions::ascending(500, 500)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "from": 500, "limit": 500, "direction": "asc" })
        );
    }

    #[test]
    fn test_into_ascending_reverses_desc_pages() {
        let id = SessionId::new("s");
        let page = MessagePage::new(vec![
            Message::new(id.clone(), 3, "user", "c"),
            Message::new(id.clone(), 2, "user", "b"),
        ]);
        let ordinals: Vec<_> = page
            .into_ascending(Direction::Desc)
            .iter()
            .map(|m| m.ordinal)
            .collect();
        assert_eq!(ordinals, vec![2, 3]);
    }
}

//! The materialized, contiguous slice of a session log
//!
//! Every mutation swaps in a whole new sequence instead of splicing the
//! current one, so a snapshot handed to an observer is never modified after
//! the fact. The window keeps two properties at all times:
//!
//! - ordinals are strictly increasing with no gaps
//! - `has_older` is true iff the oldest loaded ordinal is above zero

use std::sync::Arc;

use transcript_core::{Message, Ordinal};

use crate::error::{CacheError, CacheResult};

/// Contiguous ordinal range `[oldest, newest]` of a session, in ascending order
#[derive(Debug, Clone, Default)]
pub struct Window {
    messages: Arc<Vec<Message>>,
    has_older: bool,
    /// Advances once per replacement of `messages`
    revision: u64,
}

impl Window {
    /// Create an empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// The current sequence (cheap to clone, never mutated in place)
    pub fn messages(&self) -> &Arc<Vec<Message>> {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn oldest(&self) -> Option<Ordinal> {
        self.messages.first().map(|m| m.ordinal)
    }

    pub fn newest(&self) -> Option<Ordinal> {
        self.messages.last().map(|m| m.ordinal)
    }

    pub fn has_older(&self) -> bool {
        self.has_older
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether `ordinal` falls inside the loaded range
    pub fn contains(&self, ordinal: Ordinal) -> bool {
        match (self.oldest(), self.newest()) {
            (Some(oldest), Some(newest)) => (oldest..=newest).contains(&ordinal),
            _ => false,
        }
    }

    /// Record that the backend has nothing below the current oldest message
    pub fn mark_exhausted(&mut self) {
        self.has_older = false;
    }

    /// Drop all messages
    pub fn clear(&mut self) {
        self.swap(Vec::new());
    }

    /// Replace the whole window with an ascending run of messages.
    ///
    /// If the run has a gap, only its newest contiguous tail is kept. Returns
    /// the number of messages dropped that way.
    pub fn replace(&mut self, mut messages: Vec<Message>) -> usize {
        let start = contiguous_tail_start(&messages);
        let dropped = start;
        if start > 0 {
            messages.drain(..start);
        }
        self.swap(messages);
        dropped
    }

    /// Put an ascending run of older messages in front of the window.
    ///
    /// The run must end exactly one below the current oldest ordinal. Only its
    /// contiguous tail is used. Returns the number of messages added.
    pub fn prepend(&mut self, older: Vec<Message>) -> CacheResult<usize> {
        let Some(oldest) = self.oldest() else {
            let added = older.len() - self.replace(older);
            return Ok(added);
        };
        let Some(last) = older.last().map(|m| m.ordinal) else {
            return Ok(0);
        };
        if oldest == 0 || last != oldest - 1 {
            return Err(CacheError::Discontiguous {
                expected: oldest.saturating_sub(1),
                found: last,
            });
        }

        let start = contiguous_tail_start(&older);
        let mut merged = Vec::with_capacity(older.len() - start + self.messages.len());
        merged.extend(older.into_iter().skip(start));
        merged.extend(self.messages.iter().cloned());
        let added = merged.len() - self.messages.len();
        self.swap(merged);
        Ok(added)
    }

    /// Put an ascending run of newer messages after the window.
    ///
    /// Accepts the longest prefix that continues the window without a gap and
    /// drops the rest. Returns the number of messages appended.
    pub fn append(&mut self, newer: Vec<Message>) -> usize {
        let Some(newest) = self.newest() else {
            return newer.len() - self.replace(newer);
        };

        let mut expected = newest + 1;
        let accepted: Vec<Message> = newer
            .into_iter()
            .take_while(|m| {
                let fits = m.ordinal == expected;
                expected += 1;
                fits
            })
            .collect();
        if accepted.is_empty() {
            return 0;
        }

        let count = accepted.len();
        let mut merged = Vec::with_capacity(self.messages.len() + count);
        merged.extend(self.messages.iter().cloned());
        merged.extend(accepted);
        self.swap(merged);
        count
    }

    fn swap(&mut self, messages: Vec<Message>) {
        self.has_older = messages.first().is_some_and(|m| m.ordinal > 0);
        self.messages = Arc::new(messages);
        self.revision += 1;
    }
}

/// Index where the newest gap-free run of `messages` begins
fn contiguous_tail_start(messages: &[Message]) -> usize {
    let mut start = messages.len().saturating_sub(1);
    while start > 0 && messages[start - 1].ordinal + 1 == messages[start].ordinal {
        start -= 1;
    }
    start
}

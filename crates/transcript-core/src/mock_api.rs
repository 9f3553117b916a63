//! Mock message API for testing
//!
//! Provides an in-memory session log for exercising the cache engine
//! without a real backend. The mock can also misbehave on purpose: hold a
//! session's requests until released, fail the next N calls, or report a
//! message count that disagrees with the log.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use transcript_core::{MockMessageApi, SessionId};
//!
//! let api = MockMessageApi::new();
//! let id = SessionId::new("s1");
//! api.insert_session(&id, 1800);
//!
//! // Park every request for `id` until the test lets it through
//! api.hold(&id);
//! // ... start an operation, then:
//! api.wait_for_calls(1).await;
//! api.release(&id);
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::api::{Direction, FetchOptions, MessageApi, MessagePage};
use crate::error::{ApiError, ApiResult};
use crate::message::{Message, Ordinal, SessionId, SessionMeta};

/// A request observed by the mock, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// A paged fetch
    Fetch {
        session: SessionId,
        options: FetchOptions,
    },
    /// A metadata lookup
    Session { session: SessionId },
}

impl MockCall {
    /// The session this call targeted
    pub fn session(&self) -> &SessionId {
        match self {
            MockCall::Fetch { session, .. } | MockCall::Session { session } => session,
        }
    }
}

#[derive(Default)]
struct MockState {
    /// Ascending log per session
    logs: HashMap<SessionId, Vec<Message>>,
    /// Counts reported by `session()` instead of the log length
    reported_counts: HashMap<SessionId, u64>,
    /// Every call received so far
    calls: Vec<MockCall>,
    /// Number of upcoming calls that should fail
    failures: usize,
    /// Open/closed gates for held sessions
    gates: HashMap<SessionId, watch::Sender<bool>>,
    /// Bumped on every rewrite so replaced content is distinguishable
    rewrites: u64,
}

/// In-memory [`MessageApi`] implementation for tests and simulation
pub struct MockMessageApi {
    state: Mutex<MockState>,
    /// Total calls received, for tests that wait on request arrival
    call_count: watch::Sender<usize>,
}

impl Default for MockMessageApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMessageApi {
    /// Create an empty mock with no sessions
    pub fn new() -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            state: Mutex::new(MockState::default()),
            call_count,
        }
    }

    /// Create (or replace) a session holding ordinals `0..count`
    pub fn insert_session(&self, session: &SessionId, count: u64) {
        let mut state = self.state.lock();
        let generation = state.rewrites;
        let log = (0..count)
            .map(|ordinal| make_message(session, ordinal, generation))
            .collect();
        state.logs.insert(session.clone(), log);
    }

    /// Append `count` new messages to a session
    pub fn append(&self, session: &SessionId, count: u64) {
        let mut state = self.state.lock();
        let generation = state.rewrites;
        let log = state.logs.entry(session.clone()).or_default();
        let next = log.last().map_or(0, |m| m.ordinal + 1);
        log.extend((next..next + count).map(|ordinal| make_message(session, ordinal, generation)));
    }

    /// Drop every message at or above `len`
    pub fn truncate(&self, session: &SessionId, len: u64) {
        let mut state = self.state.lock();
        if let Some(log) = state.logs.get_mut(session) {
            log.retain(|m| m.ordinal < len);
        }
    }

    /// Replace a session's log with `count` freshly written messages
    pub fn rewrite(&self, session: &SessionId, count: u64) {
        let mut state = self.state.lock();
        state.rewrites += 1;
        let generation = state.rewrites;
        let log = (0..count)
            .map(|ordinal| make_message(session, ordinal, generation))
            .collect();
        state.logs.insert(session.clone(), log);
    }

    /// Report `count` from `session()` regardless of the log contents
    pub fn set_reported_count(&self, session: &SessionId, count: Option<u64>) {
        let mut state = self.state.lock();
        match count {
            Some(count) => {
                state.reported_counts.insert(session.clone(), count);
            }
            None => {
                state.reported_counts.remove(session);
            }
        }
    }

    /// Fail the next `n` calls with a transport error
    pub fn fail_next(&self, n: usize) {
        self.state.lock().failures = n;
    }

    /// Park all requests for `session` until [`release`](Self::release) is called
    pub fn hold(&self, session: &SessionId) {
        let mut state = self.state.lock();
        match state.gates.get(session) {
            Some(gate) => {
                gate.send_replace(false);
            }
            None => {
                let (gate, _) = watch::channel(false);
                state.gates.insert(session.clone(), gate);
            }
        }
    }

    /// Let parked and future requests for `session` through
    pub fn release(&self, session: &SessionId) {
        if let Some(gate) = self.state.lock().gates.get(session) {
            gate.send_replace(true);
        }
    }

    /// Snapshot of the session's current log
    pub fn log(&self, session: &SessionId) -> Vec<Message> {
        self.state.lock().logs.get(session).cloned().unwrap_or_default()
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Only the paged fetches received so far
    pub fn fetches(&self) -> Vec<FetchOptions> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Fetch { options, .. } => Some(*options),
                MockCall::Session { .. } => None,
            })
            .collect()
    }

    /// Number of calls received so far
    pub fn call_count(&self) -> usize {
        *self.call_count.borrow()
    }

    /// Forget recorded calls (the running total keeps counting)
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Wait until at least `n` calls have arrived in total
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.call_count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Record a call and decide whether it should fail.
    ///
    /// Returns the gate to wait on, if the session is held.
    fn admit(&self, call: MockCall) -> (bool, Option<watch::Receiver<bool>>) {
        let mut state = self.state.lock();
        let gate = state.gates.get(call.session()).map(|g| g.subscribe());
        let fail = if state.failures > 0 {
            state.failures -= 1;
            tracing::debug!(?call, remaining = state.failures, "Injecting mock failure");
            true
        } else {
            false
        };
        state.calls.push(call);
        drop(state);
        self.call_count.send_modify(|count| *count += 1);
        (fail, gate)
    }
}

async fn pass_gate(gate: Option<watch::Receiver<bool>>) {
    if let Some(mut gate) = gate {
        // A dropped gate means the mock itself is gone; let the call through.
        let _ = gate.wait_for(|open| *open).await;
    }
}

fn make_message(session: &SessionId, ordinal: Ordinal, generation: u64) -> Message {
    let role = if ordinal % 2 == 0 { "user" } else { "assistant" };
    let content = if generation == 0 {
        format!("message {ordinal}")
    } else {
        format!("message {ordinal} (rewrite {generation})")
    };
    Message::new(session.clone(), ordinal, role, content)
}

#[async_trait]
impl MessageApi for MockMessageApi {
    async fn fetch(&self, session: &SessionId, options: FetchOptions) -> ApiResult<MessagePage> {
        let (fail, gate) = self.admit(MockCall::Fetch {
            session: session.clone(),
            options,
        });
        pass_gate(gate).await;
        if fail {
            return Err(ApiError::Transport("injected failure".into()));
        }

        let state = self.state.lock();
        let log = state
            .logs
            .get(session)
            .ok_or_else(|| ApiError::SessionNotFound(session.to_string()))?;

        let messages = match options.direction {
            Direction::Asc => {
                let from = options.from.unwrap_or(0);
                log.iter()
                    .filter(|m| m.ordinal >= from)
                    .take(options.limit)
                    .cloned()
                    .collect()
            }
            Direction::Desc => {
                let from = options.from.unwrap_or(Ordinal::MAX);
                log.iter()
                    .rev()
                    .filter(|m| m.ordinal <= from)
                    .take(options.limit)
                    .cloned()
                    .collect()
            }
        };
        Ok(MessagePage::new(messages))
    }

    async fn session(&self, session: &SessionId) -> ApiResult<SessionMeta> {
        let (fail, gate) = self.admit(MockCall::Session {
            session: session.clone(),
        });
        pass_gate(gate).await;
        if fail {
            return Err(ApiError::Transport("injected failure".into()));
        }

        let state = self.state.lock();
        let log = state
            .logs
            .get(session)
            .ok_or_else(|| ApiError::SessionNotFound(session.to_string()))?;
        let count = state
            .reported_counts
            .get(session)
            .copied()
            .unwrap_or(log.len() as u64);
        Ok(SessionMeta::new(session.clone(), count))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn ordinals(page: &MessagePage) -> Vec<Ordinal> {
        page.messages.iter().map(|m| m.ordinal).collect()
    }

    #[tokio::test]
    async fn test_desc_latest_page() {
        let api = MockMessageApi::new();
        let id = SessionId::new("s1");
        api.insert_session(&id, 10);

        let page = api.fetch(&id, FetchOptions::latest(3)).await.unwrap();
        assert_eq!(ordinals(&page), vec![9, 8, 7]);

        let page = api.fetch(&id, FetchOptions::descending(4, 3)).await.unwrap();
        assert_eq!(ordinals(&page), vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn test_asc_pages_stop_at_end() {
        let api = MockMessageApi::new();
        let id = SessionId::new("s1");
        api.insert_session(&id, 10);

        let page = api.fetch(&id, FetchOptions::ascending(8, 5)).await.unwrap();
        assert_eq!(ordinals(&page), vec![8, 9]);

        let page = api.fetch(&id, FetchOptions::ascending(10, 5)).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let api = MockMessageApi::new();
        let err = api.session(&SessionId::new("nope")).await.unwrap_err();
        assert_eq!(err, ApiError::SessionNotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_reported_count_override() {
        let api = MockMessageApi::new();
        let id = SessionId::new("s1");
        api.insert_session(&id, 3);
        assert_eq!(api.session(&id).await.unwrap().count(), 3);

        api.set_reported_count(&id, Some(5));
        assert_eq!(api.session(&id).await.unwrap().count(), 5);

        api.set_reported_count(&id, None);
        assert_eq!(api.session(&id).await.unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let api = MockMessageApi::new();
        let id = SessionId::new("s1");
        api.insert_session(&id, 3);
        api.fail_next(1);

        tokio_test::assert_err!(api.session(&id).await);
        tokio_test::assert_ok!(api.session(&id).await);
        assert_eq!(api.call_count(), 2);
    }

    #[tokio::test]
    async fn test_append_truncate_rewrite() {
        let api = MockMessageApi::new();
        let id = SessionId::new("s1");
        api.insert_session(&id, 3);
        api.append(&id, 2);
        assert_eq!(api.log(&id).len(), 5);
        assert_eq!(api.log(&id)[4].ordinal, 4);

        api.truncate(&id, 2);
        assert_eq!(api.log(&id).len(), 2);

        api.rewrite(&id, 4);
        let log = api.log(&id);
        assert_eq!(log.len(), 4);
        assert!(log[0].content.contains("rewrite 1"));
    }

    #[tokio::test]
    async fn test_hold_parks_until_release() {
        let api = Arc::new(MockMessageApi::new());
        let id = SessionId::new("s1");
        api.insert_session(&id, 3);
        api.hold(&id);

        let task = {
            let api = api.clone();
            let id = id.clone();
            tokio::spawn(async move { api.fetch(&id, FetchOptions::latest(10)).await })
        };

        api.wait_for_calls(1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        api.release(&id);
        let page = task.await.unwrap().unwrap();
        assert_eq!(page.len(), 3);
    }
}

//! Session-scoped message cache
//!
//! [`MessageCache`] owns the window for the one active session, plus the
//! prefetch buffer and the reload supervisor that serve it. It is a cheap
//! cloneable handle; clones share state.
//!
//! All shared state sits behind one mutex that is never held across an
//! `.await`. Every step that suspends captures a [`SessionTicket`] first and
//! checks it again after resuming, so work started for a previous session
//! (or before a `clear`) can never touch the current window.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use transcript_core::{Direction, FetchOptions, Message, MessageApi, Ordinal, SessionId};

use crate::config::CacheConfig;
use crate::epoch::Epoch;
use crate::error::{CacheError, CacheResult};
use crate::prefetch::{PrefetchRun, PrefetchState, PrefetchStatus};
use crate::supervisor::TaskSupervisor;
use crate::window::Window;

/// Identifies the session selection an operation was started for
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionTicket {
    pub(crate) session: SessionId,
    pub(crate) epoch: Epoch,
}

/// Everything the cache knows about the active session
pub(crate) struct CacheState {
    pub(crate) session: Option<SessionId>,
    /// Bumped on every session switch or clear
    pub(crate) session_epoch: Epoch,
    pub(crate) window: Window,
    pub(crate) loading: bool,
    pub(crate) loading_older: bool,
    /// Last known total number of messages
    pub(crate) message_count: u64,
    pub(crate) prefetch: PrefetchState,
    pub(crate) reload: TaskSupervisor<SessionTicket>,
    /// Consecutive failed reconciliations
    pub(crate) sync_failures: u32,
}

impl CacheState {
    fn new() -> Self {
        Self {
            session: None,
            session_epoch: Epoch::ZERO,
            window: Window::new(),
            loading: false,
            loading_older: false,
            message_count: 0,
            prefetch: PrefetchState::default(),
            reload: TaskSupervisor::new(),
            sync_failures: 0,
        }
    }

    pub(crate) fn ticket(&self) -> Option<SessionTicket> {
        self.session.as_ref().map(|session| SessionTicket {
            session: session.clone(),
            epoch: self.session_epoch,
        })
    }

    pub(crate) fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.session_epoch == ticket.epoch && self.session.as_ref() == Some(&ticket.session)
    }

    /// Drop everything and invalidate all outstanding work
    fn reset(&mut self, session: Option<SessionId>) {
        self.session = session;
        self.session_epoch.bump();
        self.window.clear();
        self.loading = false;
        self.loading_older = false;
        self.message_count = 0;
        self.prefetch.cancel();
        self.reload.reset();
        self.sync_failures = 0;
    }

    /// Start a prefetch run below the current window, cancelling any other
    pub(crate) fn begin_prefetch(&mut self) -> Option<PrefetchRun> {
        match self.window.oldest() {
            Some(oldest) if oldest > 0 => Some(self.prefetch.begin(oldest)),
            _ => None,
        }
    }

    /// Move a completed prefetch buffer into the window in one swap.
    ///
    /// Returns the number of messages added, or `None` if there was nothing
    /// usable to flush.
    pub(crate) fn flush_prefetch(&mut self) -> Option<usize> {
        let buffer = self.prefetch.take_complete()?;
        match self.window.prepend(buffer) {
            Ok(added) => Some(added),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding prefetch buffer that no longer abuts the window");
                None
            }
        }
    }

    fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            session: self.session.clone(),
            messages: self.window.messages().clone(),
            revision: self.window.revision(),
            loading: self.loading,
            loading_older: self.loading_older,
            has_older: self.window.has_older(),
            message_count: self.message_count,
            prefetch: self.prefetch.status(),
            prefetch_buffered: self.prefetch.buffered(),
            sync_failures: self.sync_failures,
        }
    }
}

/// Immutable view of the window handed to observers
#[derive(Debug, Clone, Default)]
pub struct WindowSnapshot {
    /// Session the window belongs to
    pub session: Option<SessionId>,
    /// Contiguous ascending messages
    pub messages: Arc<Vec<Message>>,
    /// Advances once per replacement of `messages`
    pub revision: u64,
    /// Initial or full load in progress
    pub loading: bool,
    /// Backward extension in progress
    pub loading_older: bool,
    /// More history exists below the window
    pub has_older: bool,
    /// Last known total message count
    pub message_count: u64,
    /// Background prefetch progress
    pub prefetch: PrefetchStatus,
    /// Messages waiting in the prefetch buffer
    pub prefetch_buffered: usize,
    /// Consecutive failed reconciliations (informational)
    pub sync_failures: u32,
}

impl WindowSnapshot {
    pub fn oldest(&self) -> Option<Ordinal> {
        self.messages.first().map(|m| m.ordinal)
    }

    pub fn newest(&self) -> Option<Ordinal> {
        self.messages.last().map(|m| m.ordinal)
    }
}

/// Result of [`MessageCache::load_session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The session was already loaded or loading
    AlreadyLoaded,
    /// The initial window was fetched
    Loaded { count: usize, has_older: bool },
    /// Another selection replaced this one before the fetch returned
    Superseded,
    /// The fetch failed; re-select or reload to retry
    Failed,
}

pub(crate) struct CacheInner<A> {
    pub(crate) api: Arc<A>,
    pub(crate) config: CacheConfig,
    pub(crate) state: Mutex<CacheState>,
    snapshots: watch::Sender<WindowSnapshot>,
}

impl<A> CacheInner<A> {
    /// Push the current state to observers. Call with the state lock held.
    pub(crate) fn publish(&self, state: &CacheState) {
        self.snapshots.send_replace(state.snapshot());
    }
}

/// Windowed cache over one remote session log at a time
pub struct MessageCache<A> {
    pub(crate) inner: Arc<CacheInner<A>>,
}

impl<A> Clone for MessageCache<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> std::fmt::Debug for MessageCache<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCache").finish_non_exhaustive()
    }
}

impl<A: MessageApi + 'static> MessageCache<A> {
    /// Create a cache with the default configuration
    pub fn new(api: Arc<A>) -> Self {
        Self::build(api, CacheConfig::default())
    }

    /// Create a cache with a custom configuration
    pub fn with_config(api: Arc<A>, config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self::build(api, config))
    }

    fn build(api: Arc<A>, config: CacheConfig) -> Self {
        let state = CacheState::new();
        let (snapshots, _) = watch::channel(state.snapshot());
        Self {
            inner: Arc::new(CacheInner {
                api,
                config,
                state: Mutex::new(state),
                snapshots,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn api(&self) -> &Arc<A> {
        &self.inner.api
    }

    /// Observe the window; every update is a whole new snapshot
    pub fn subscribe(&self) -> watch::Receiver<WindowSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// The current window
    pub fn snapshot(&self) -> WindowSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    /// Active session, if any
    pub fn session(&self) -> Option<SessionId> {
        self.inner.state.lock().session.clone()
    }

    pub fn messages(&self) -> Arc<Vec<Message>> {
        self.inner.state.lock().window.messages().clone()
    }

    pub fn has_older(&self) -> bool {
        self.inner.state.lock().window.has_older()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    pub fn is_loading_older(&self) -> bool {
        self.inner.state.lock().loading_older
    }

    pub fn message_count(&self) -> u64 {
        self.inner.state.lock().message_count
    }

    /// Select a session and fetch its newest messages.
    ///
    /// Selecting the session that is already loaded (or loading) does
    /// nothing. Otherwise all state for the previous session is dropped, the
    /// newest `first_batch` messages are fetched, and a background prefetch
    /// starts if older history exists.
    pub async fn load_session(&self, id: SessionId) -> LoadOutcome {
        let ticket = {
            let mut state = self.inner.state.lock();
            if state.session.as_ref() == Some(&id) && (!state.window.is_empty() || state.loading) {
                return LoadOutcome::AlreadyLoaded;
            }
            state.reset(Some(id));
            state.loading = true;
            self.inner.publish(&state);
            match state.ticket() {
                Some(ticket) => ticket,
                None => return LoadOutcome::Superseded,
            }
        };
        tracing::debug!(session = %ticket.session, epoch = %ticket.epoch, "Loading session");

        let busy = BusyGuard::new(&self.inner, ticket.clone(), Busy::Loading);
        let result = self.load_progressively(&ticket).await;
        busy.finish();

        match result {
            Ok(count) => {
                let has_older = self.has_older();
                tracing::debug!(session = %ticket.session, count, has_older, "Loaded initial window");
                LoadOutcome::Loaded { count, has_older }
            }
            Err(e) if e.is_superseded() => {
                tracing::trace!(session = %ticket.session, "Initial load superseded");
                LoadOutcome::Superseded
            }
            Err(e) => {
                tracing::warn!(session = %ticket.session, error = %e, "Failed to load session (non-fatal)");
                LoadOutcome::Failed
            }
        }
    }

    /// Forget the active session and everything loaded for it
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.reset(None);
        self.inner.publish(&state);
        tracing::debug!("Cleared message cache");
    }

    /// Fetch the newest `first_batch` messages and make them the whole window.
    ///
    /// Returns the new window length. Starts a background prefetch when the
    /// window does not reach ordinal 0.
    pub(crate) async fn load_progressively(&self, ticket: &SessionTicket) -> CacheResult<usize> {
        let options = FetchOptions::latest(self.inner.config.first_batch);
        let page = self.inner.api.fetch(&ticket.session, options).await;

        let (count, run) = {
            let mut state = self.inner.state.lock();
            if !state.is_current(ticket) {
                return Err(CacheError::Superseded);
            }
            let messages = page?.into_ascending(Direction::Desc);

            // The lower bound moves, so buffered history is stale.
            state.prefetch.cancel();
            let dropped = state.window.replace(messages);
            if dropped > 0 {
                tracing::warn!(session = %ticket.session, dropped, "Initial page had a gap; keeping newest contiguous run");
            }
            state.message_count = state.window.newest().map_or(0, |newest| newest + 1);
            let run = state.begin_prefetch();
            self.inner.publish(&state);
            (state.window.len(), run)
        };

        if let Some(run) = run {
            self.spawn_prefetch(ticket.clone(), run);
        }
        Ok(count)
    }

}

/// Busy flag owned by a [`BusyGuard`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Busy {
    Loading,
    LoadingOlder,
}

/// Clears a busy flag when the operation that raised it ends.
///
/// The flag is also cleared when the operation's future is dropped at an
/// `.await`, so a cancelled call cannot leave the cache looking busy. Only
/// the flag of the selection the guard was created for is touched.
pub(crate) struct BusyGuard<'a, A> {
    inner: &'a CacheInner<A>,
    ticket: SessionTicket,
    busy: Busy,
    armed: bool,
}

impl<'a, A> BusyGuard<'a, A> {
    /// Take ownership of a flag the caller has just raised
    pub(crate) fn new(inner: &'a CacheInner<A>, ticket: SessionTicket, busy: Busy) -> Self {
        Self {
            inner,
            ticket,
            busy,
            armed: true,
        }
    }

    /// Clear the flag under a lock the caller already holds.
    ///
    /// Returns whether the flag was cleared; the caller publishes.
    pub(crate) fn release(&mut self, state: &mut CacheState) -> bool {
        if !std::mem::replace(&mut self.armed, false) || !state.is_current(&self.ticket) {
            return false;
        }
        match self.busy {
            Busy::Loading => state.loading = false,
            Busy::LoadingOlder => state.loading_older = false,
        }
        true
    }

    /// Clear the flag and publish
    pub(crate) fn finish(mut self) {
        let inner = self.inner;
        let mut state = inner.state.lock();
        if self.release(&mut state) {
            inner.publish(&state);
        }
    }
}

impl<A> Drop for BusyGuard<'_, A> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = self.inner;
        let mut state = inner.state.lock();
        if self.release(&mut state) {
            tracing::debug!(session = %self.ticket.session, busy = ?self.busy, "Operation dropped before finishing");
            inner.publish(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use transcript_core::{MockMessageApi, is_contiguous};

    use super::*;

    fn setup(sessions: &[(&str, u64)]) -> (Arc<MockMessageApi>, MessageCache<MockMessageApi>) {
        let api = Arc::new(MockMessageApi::new());
        for (id, count) in sessions {
            api.insert_session(&SessionId::new(*id), *count);
        }
        let cache = MessageCache::new(api.clone());
        (api, cache)
    }

    #[tokio::test]
    async fn test_small_session_loads_entirely() {
        let (api, cache) = setup(&[("s1", 40)]);

        let outcome = cache.load_session(SessionId::new("s1")).await;
        assert_eq!(outcome, LoadOutcome::Loaded { count: 40, has_older: false });

        let snap = cache.snapshot();
        assert_eq!(snap.oldest(), Some(0));
        assert_eq!(snap.newest(), Some(39));
        assert_eq!(snap.message_count, 40);
        assert!(!snap.has_older);
        assert!(!snap.loading);
        assert!(is_contiguous(&snap.messages));

        // No prefetch for a complete window
        assert_eq!(api.fetches(), vec![FetchOptions::latest(1000)]);
    }

    #[tokio::test]
    async fn test_empty_session() {
        let (_api, cache) = setup(&[("empty", 0)]);

        let outcome = cache.load_session(SessionId::new("empty")).await;
        assert_eq!(outcome, LoadOutcome::Loaded { count: 0, has_older: false });
        assert_eq!(cache.message_count(), 0);
        assert!(cache.messages().is_empty());
    }

    #[tokio::test]
    async fn test_reselect_is_idempotent() {
        let (api, cache) = setup(&[("s1", 40)]);
        let id = SessionId::new("s1");

        cache.load_session(id.clone()).await;
        let calls = api.call_count();

        assert_eq!(cache.load_session(id).await, LoadOutcome::AlreadyLoaded);
        assert_eq!(api.call_count(), calls);
    }

    #[tokio::test]
    async fn test_failed_load_clears_loading_flag() {
        let (api, cache) = setup(&[("s1", 40)]);
        api.fail_next(1);

        let outcome = cache.load_session(SessionId::new("s1")).await;
        assert_eq!(outcome, LoadOutcome::Failed);
        assert!(!cache.is_loading());
        assert!(cache.messages().is_empty());

        // Empty and idle, so selecting again retries.
        let outcome = cache.load_session(SessionId::new("s1")).await;
        assert!(matches!(outcome, LoadOutcome::Loaded { count: 40, .. }));
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let (_api, cache) = setup(&[("s1", 40)]);
        cache.load_session(SessionId::new("s1")).await;

        cache.clear();
        let snap = cache.snapshot();
        assert_eq!(snap.session, None);
        assert!(snap.messages.is_empty());
        assert_eq!(snap.message_count, 0);
        assert!(!snap.has_older);
        assert!(!snap.loading);
    }

    #[tokio::test]
    async fn test_switch_invalidates_inflight_load() {
        let (api, cache) = setup(&[("a", 30), ("b", 20)]);
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        api.hold(&a);

        let pending = {
            let cache = cache.clone();
            let a = a.clone();
            tokio::spawn(async move { cache.load_session(a).await })
        };
        api.wait_for_calls(1).await;

        cache.load_session(b.clone()).await;
        let revision = cache.snapshot().revision;

        api.release(&a);
        let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, LoadOutcome::Superseded);

        let snap = cache.snapshot();
        assert_eq!(snap.session, Some(b));
        assert_eq!(snap.messages.len(), 20);
        assert_eq!(snap.revision, revision);
    }

    #[tokio::test]
    async fn test_same_session_after_clear_ignores_stale_fetch() {
        let (api, cache) = setup(&[("a", 30)]);
        let a = SessionId::new("a");
        api.hold(&a);

        let stale = {
            let cache = cache.clone();
            let a = a.clone();
            tokio::spawn(async move { cache.load_session(a).await })
        };
        api.wait_for_calls(1).await;

        cache.clear();
        let fresh = {
            let cache = cache.clone();
            let a = a.clone();
            tokio::spawn(async move { cache.load_session(a).await })
        };
        api.wait_for_calls(2).await;
        api.release(&a);

        assert_eq!(stale.await.unwrap(), LoadOutcome::Superseded);
        assert!(matches!(fresh.await.unwrap(), LoadOutcome::Loaded { count: 30, .. }));
        assert_eq!(cache.messages().len(), 30);
    }

    #[tokio::test]
    async fn test_dropped_load_clears_loading_flag() {
        let (api, cache) = setup(&[("s1", 40)]);
        let id = SessionId::new("s1");
        api.hold(&id);

        let dropped = tokio::time::timeout(Duration::from_millis(50), cache.load_session(id.clone())).await;
        tokio_test::assert_err!(dropped);
        assert!(!cache.is_loading());
        assert!(cache.messages().is_empty());

        // Still selected but empty and idle, so selecting again retries.
        api.release(&id);
        let outcome = cache.load_session(id).await;
        assert!(matches!(outcome, LoadOutcome::Loaded { count: 40, .. }));
    }

    #[tokio::test]
    async fn test_with_config_validates() {
        let api = Arc::new(MockMessageApi::new());
        let config = CacheConfig::new().with_first_batch(0);
        tokio_test::assert_err!(MessageCache::with_config(api, config));
    }
}

//! Backward extension of the window on demand
//!
//! Scrolling to the top or jumping to an old position extends the window
//! backward. A completed prefetch buffer is always preferred: it is spliced
//! in with one swap and no network call. Otherwise a running prefetch is
//! cancelled (interactive work wins) and exactly the missing page is fetched.

use transcript_core::{Direction, FetchOptions, MessageApi, Ordinal};

use crate::cache::{Busy, BusyGuard, CacheState, MessageCache, SessionTicket};
use crate::error::{CacheError, CacheResult};

/// Result of a backfill step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// The prefetch buffer was spliced in without a network call
    Flushed { count: usize },
    /// `count` older messages were fetched and prepended
    Fetched { count: usize },
    /// The requested ordinal was already in the window
    AlreadyLoaded,
    /// There is nothing older to load
    Exhausted,
    /// No session, empty window, or another backfill is running
    Skipped,
    /// The session changed while the fetch was in flight
    Superseded,
    /// The fetch failed or returned an unusable page
    Failed,
}

/// What the synchronous part of `load_older` decided
enum Step {
    Done(BackfillOutcome),
    Fetch { ticket: SessionTicket, oldest: Ordinal },
}

impl<A: MessageApi + 'static> MessageCache<A> {
    /// Extend the window backward by one step.
    ///
    /// Flushes a completed prefetch buffer if there is one; otherwise fetches
    /// one `batch_size` page ending just below the oldest loaded message.
    pub async fn load_older(&self) -> BackfillOutcome {
        let step = {
            let mut state = self.inner.state.lock();
            let step = self.plan_older(&mut state);
            self.inner.publish(&state);
            step
        };

        match step {
            Step::Done(outcome) => outcome,
            Step::Fetch { ticket, oldest } => match self.fetch_older(&ticket, oldest).await {
                Ok(BackfillOutcome::Fetched { count }) => {
                    tracing::debug!(session = %ticket.session, count, "Loaded older page");
                    BackfillOutcome::Fetched { count }
                }
                Ok(outcome) => outcome,
                Err(e) if e.is_superseded() => BackfillOutcome::Superseded,
                Err(e) => {
                    tracing::warn!(session = %ticket.session, error = %e, "Failed to load older messages (non-fatal)");
                    BackfillOutcome::Failed
                }
            },
        }
    }

    /// Extend the window backward until it contains `target`.
    ///
    /// A completed prefetch buffer is used in a single swap. Otherwise pages
    /// are fetched one at a time until the target is reached, history runs
    /// out, or a step makes no progress. Returns `Flushed` when only the
    /// buffer was used and `Fetched` (counting both) once any page was
    /// fetched directly.
    pub async fn ensure_ordinal_loaded(&self, target: Ordinal) -> BackfillOutcome {
        {
            let mut state = self.inner.state.lock();
            let Some(oldest) = state.window.oldest() else {
                return BackfillOutcome::Skipped;
            };
            if state.session.is_none() {
                return BackfillOutcome::Skipped;
            }
            if oldest <= target {
                return BackfillOutcome::AlreadyLoaded;
            }
            if state.prefetch.is_running() {
                state.prefetch.cancel();
                self.inner.publish(&state);
                tracing::debug!(target, "Cancelled prefetch for interactive jump");
            }
        }

        let mut flushed = 0;
        let mut fetched = 0;
        loop {
            let before = {
                let state = self.inner.state.lock();
                match state.window.oldest() {
                    Some(oldest) if state.session.is_some() && state.window.has_older() => {
                        if oldest <= target {
                            break;
                        }
                        oldest
                    }
                    _ => break,
                }
            };

            match self.load_older().await {
                BackfillOutcome::Flushed { count } => flushed += count,
                BackfillOutcome::Fetched { count } => fetched += count,
                BackfillOutcome::Superseded => return BackfillOutcome::Superseded,
                BackfillOutcome::Failed => return BackfillOutcome::Failed,
                _ => break,
            }

            let progressed = self.inner.state.lock().window.oldest().is_some_and(|o| o < before);
            if !progressed {
                break;
            }
        }

        let reached = self.inner.state.lock().window.contains(target);
        match (reached, flushed, fetched) {
            (true, 0, 0) => BackfillOutcome::AlreadyLoaded,
            (true, count, 0) => BackfillOutcome::Flushed { count },
            (true, flushed, fetched) => BackfillOutcome::Fetched { count: flushed + fetched },
            (false, ..) if !self.has_older() => BackfillOutcome::Exhausted,
            (false, ..) => BackfillOutcome::Skipped,
        }
    }

    fn plan_older(&self, state: &mut CacheState) -> Step {
        if let Some(count) = state.flush_prefetch() {
            tracing::debug!(count, "Flushed prefetch buffer into window");
            return Step::Done(BackfillOutcome::Flushed { count });
        }

        let Some(ticket) = state.ticket() else {
            return Step::Done(BackfillOutcome::Skipped);
        };
        if state.loading_older || !state.window.has_older() {
            return Step::Done(BackfillOutcome::Skipped);
        }
        let Some(oldest) = state.window.oldest() else {
            return Step::Done(BackfillOutcome::Skipped);
        };
        if oldest == 0 {
            state.window.mark_exhausted();
            return Step::Done(BackfillOutcome::Exhausted);
        }

        // The lower bound is about to move without the buffer; a running or
        // partial prefetch can no longer be spliced in.
        if state.prefetch.is_running() {
            tracing::debug!(session = %ticket.session, "Cancelled prefetch for interactive backfill");
        }
        state.prefetch.cancel();
        state.loading_older = true;
        Step::Fetch { ticket, oldest }
    }

    async fn fetch_older(&self, ticket: &SessionTicket, oldest: Ordinal) -> CacheResult<BackfillOutcome> {
        let mut busy = BusyGuard::new(&self.inner, ticket.clone(), Busy::LoadingOlder);
        let options = FetchOptions::descending(oldest - 1, self.inner.config.batch_size);
        let page = self.inner.api.fetch(&ticket.session, options).await;

        let mut state = self.inner.state.lock();
        if !busy.release(&mut state) {
            return Err(CacheError::Superseded);
        }
        let result = page.map_err(CacheError::from).and_then(|page| {
            if page.is_empty() {
                state.window.mark_exhausted();
                return Ok(BackfillOutcome::Exhausted);
            }
            let count = state.window.prepend(page.into_ascending(Direction::Desc))?;
            Ok(BackfillOutcome::Fetched { count })
        });
        self.inner.publish(&state);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use transcript_core::{MockMessageApi, SessionId, is_contiguous};

    use super::*;
    use crate::cache::WindowSnapshot;
    use crate::prefetch::PrefetchStatus;

    fn setup(count: u64) -> (Arc<MockMessageApi>, MessageCache<MockMessageApi>, SessionId) {
        let api = Arc::new(MockMessageApi::new());
        let id = SessionId::new("s1");
        api.insert_session(&id, count);
        let cache = MessageCache::new(api.clone());
        (api, cache, id)
    }

    async fn wait_for(cache: &MessageCache<MockMessageApi>, f: impl FnMut(&WindowSnapshot) -> bool) {
        let mut rx = cache.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
            .await
            .expect("timed out waiting for cache state")
            .expect("cache dropped");
    }

    #[tokio::test]
    async fn test_flush_after_prefetch_makes_no_network_call() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id).await;
        wait_for(&cache, |s| s.prefetch == PrefetchStatus::Complete).await;
        let calls = api.call_count();

        assert_eq!(cache.load_older().await, BackfillOutcome::Flushed { count: 800 });
        assert_eq!(api.call_count(), calls);

        let snap = cache.snapshot();
        assert_eq!(snap.messages.len(), 1800);
        assert_eq!(snap.oldest(), Some(0));
        assert!(!snap.has_older);
        assert!(is_contiguous(&snap.messages));

        // Nothing left to do
        assert_eq!(cache.load_older().await, BackfillOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_direct_fetch_cancels_running_prefetch() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id.clone()).await;
        assert_eq!(cache.snapshot().prefetch, PrefetchStatus::Running);

        let outcome = cache.load_older().await;
        assert_eq!(outcome, BackfillOutcome::Fetched { count: 500 });

        let snap = cache.snapshot();
        assert_eq!(snap.oldest(), Some(300));
        assert!(snap.has_older);
        assert!(!snap.loading_older);
        assert_eq!(snap.prefetch, PrefetchStatus::Idle);
        assert_eq!(snap.prefetch_buffered, 0);
        assert!(api.fetches().contains(&FetchOptions::descending(799, 500)));

        // Second step reaches the start of the log
        assert_eq!(cache.load_older().await, BackfillOutcome::Fetched { count: 300 });
        let snap = cache.snapshot();
        assert_eq!(snap.oldest(), Some(0));
        assert!(!snap.has_older);
        assert_eq!(snap.messages.len(), 1800);
    }

    #[tokio::test]
    async fn test_skipped_while_loading_older() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id.clone()).await;

        api.hold(&id);
        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.load_older().await })
        };
        wait_for(&cache, |s| s.loading_older).await;

        assert_eq!(cache.load_older().await, BackfillOutcome::Skipped);
        api.release(&id);
        assert_eq!(first.await.unwrap(), BackfillOutcome::Fetched { count: 500 });
    }

    #[tokio::test]
    async fn test_dropped_fetch_clears_loading_older() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id.clone()).await;

        api.hold(&id);
        let dropped = tokio::time::timeout(Duration::from_millis(50), cache.load_older()).await;
        tokio_test::assert_err!(dropped);
        assert!(!cache.is_loading_older());

        api.release(&id);
        assert_eq!(cache.load_older().await, BackfillOutcome::Fetched { count: 500 });
        assert_eq!(cache.snapshot().oldest(), Some(300));
    }

    #[tokio::test]
    async fn test_buffer_that_no_longer_abuts_is_discarded() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id).await;
        wait_for(&cache, |s| s.prefetch == PrefetchStatus::Complete).await;

        // Buffer holds 0..=799; move the window's lower bound up to 1000
        {
            let mut state = cache.inner.state.lock();
            let tail = state.window.messages()[200..].to_vec();
            state.window.replace(tail);
        }
        api.clear_calls();

        assert_eq!(cache.load_older().await, BackfillOutcome::Fetched { count: 500 });
        assert_eq!(api.fetches(), vec![FetchOptions::descending(999, 500)]);

        let snap = cache.snapshot();
        assert_eq!(snap.oldest(), Some(500));
        assert!(is_contiguous(&snap.messages));
        assert_eq!(snap.prefetch_buffered, 0);
        assert_ne!(snap.prefetch, PrefetchStatus::Complete);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_window() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id).await;
        let before = cache.snapshot();

        api.fail_next(1);
        assert_eq!(cache.load_older().await, BackfillOutcome::Failed);

        let after = cache.snapshot();
        assert_eq!(after.oldest(), before.oldest());
        assert!(!after.loading_older);
        assert!(after.has_older);
    }

    #[tokio::test]
    async fn test_no_session_is_skipped() {
        let (_api, cache, _id) = setup(10);
        assert_eq!(cache.load_older().await, BackfillOutcome::Skipped);
        assert_eq!(cache.ensure_ordinal_loaded(0).await, BackfillOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_ensure_uses_buffer_in_one_update() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id).await;
        wait_for(&cache, |s| s.prefetch == PrefetchStatus::Complete).await;
        let calls = api.call_count();
        let revision = cache.snapshot().revision;

        assert_eq!(cache.ensure_ordinal_loaded(0).await, BackfillOutcome::Flushed { count: 800 });
        assert_eq!(api.call_count(), calls);
        assert_eq!(cache.snapshot().revision, revision + 1);
        assert_eq!(cache.snapshot().oldest(), Some(0));
    }

    #[tokio::test]
    async fn test_ensure_fetches_page_by_page_without_buffer() {
        let (api, cache, id) = setup(3000);
        cache.load_session(id).await;
        api.clear_calls();

        // Window is 2000..2999; ordinal 1200 needs two pages (1500.., 1000..)
        assert_eq!(cache.ensure_ordinal_loaded(1200).await, BackfillOutcome::Fetched { count: 1000 });
        let snap = cache.snapshot();
        assert_eq!(snap.oldest(), Some(1000));
        assert!(is_contiguous(&snap.messages));

        let descending: Vec<_> = api
            .fetches()
            .into_iter()
            .filter(|f| f.direction == Direction::Desc)
            .collect();
        assert_eq!(
            descending,
            vec![FetchOptions::descending(1999, 500), FetchOptions::descending(1499, 500)]
        );
    }

    #[tokio::test]
    async fn test_ensure_already_loaded() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id).await;
        let calls = api.call_count();
        assert_eq!(cache.ensure_ordinal_loaded(900).await, BackfillOutcome::AlreadyLoaded);
        assert_eq!(api.call_count(), calls);
    }

    #[tokio::test]
    async fn test_ensure_stops_when_history_shrank() {
        let (api, cache, id) = setup(1800);
        cache.load_session(id.clone()).await;

        // Remote rewrite removed everything below the window
        api.rewrite(&id, 0);
        assert_eq!(cache.ensure_ordinal_loaded(0).await, BackfillOutcome::Exhausted);
        assert!(!cache.has_older());
        assert_eq!(cache.snapshot().oldest(), Some(800));
    }
}

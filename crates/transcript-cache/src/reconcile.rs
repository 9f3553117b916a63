//! Reconciliation against the authoritative message count
//!
//! An external change signal only says "something may have changed". The
//! reconciler re-derives the truth: it asks the backend for the session's
//! message count and compares it with the cached one.
//!
//! - unchanged: nothing to do
//! - grown, window non-empty: append pages from `newest + 1` (fast path)
//! - shrunk, or window empty: full reload
//!
//! If the fast path ends anywhere but `count - 1`, the log was rewritten
//! underneath us and a full reload repairs the window.
//!
//! Runs are single-flight per session through a [`TaskSupervisor`](crate::TaskSupervisor).

use transcript_core::{FetchOptions, MessageApi, Ordinal};

use crate::cache::{Busy, BusyGuard, CacheInner, MessageCache, SessionTicket};
use crate::error::{CacheError, CacheResult};
use crate::supervisor::{Admission, Completion, RunToken};

/// Result of [`MessageCache::reload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// No session selected
    NoSession,
    /// The authoritative count matches the cache
    Unchanged,
    /// `count` new messages were appended
    Appended { count: usize },
    /// The window was replaced by a fresh load of `count` messages
    FullReload { count: usize },
    /// Folded into a reload that was already running
    Coalesced,
    /// The session changed during the reload
    Superseded,
    /// The reload failed; the window is left as last known good
    Failed,
}

/// Owns the running reload cycle.
///
/// If the reload future is dropped between passes, the cycle is abandoned so
/// later reloads for the session are not coalesced into a run that will
/// never finish.
struct ReloadRun<'a, A> {
    inner: &'a CacheInner<A>,
    token: Option<RunToken>,
}

impl<A> ReloadRun<'_, A> {
    /// Report a finished pass; keeps the token only if another pass is due
    fn finish(&mut self, ticket: &SessionTicket) -> Completion {
        let Some(token) = self.token else {
            return Completion::Stale;
        };
        let mut state = self.inner.state.lock();
        let current = state.is_current(ticket);
        let completion = state.reload.finish(token, current);
        if !matches!(completion, Completion::RunAgain(_)) {
            self.token = None;
        }
        completion
    }
}

impl<A> Drop for ReloadRun<'_, A> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if self.inner.state.lock().reload.abandon(token) {
                tracing::debug!("Reload dropped mid-pass; cycle abandoned");
            }
        }
    }
}

impl<A: MessageApi + 'static> MessageCache<A> {
    /// Bring the window up to date with the backend.
    ///
    /// If a reload for the active session is already running, this call is
    /// folded into it: the running reload performs exactly one more pass
    /// when it finishes, and this call returns once that pass is done.
    pub async fn reload(&self) -> ReloadOutcome {
        let (ticket, admission) = {
            let mut state = self.inner.state.lock();
            let Some(ticket) = state.ticket() else {
                return ReloadOutcome::NoSession;
            };
            let admission = state.reload.request(&ticket);
            (ticket, admission)
        };

        let token = match admission {
            Admission::Start(token) => token,
            Admission::Coalesced(waiter) => {
                tracing::trace!(session = %ticket.session, "Reload coalesced into running pass");
                waiter.wait().await;
                return ReloadOutcome::Coalesced;
            }
        };

        let mut run = ReloadRun {
            inner: &self.inner,
            token: Some(token),
        };
        let mut outcome = self.reload_once(&ticket).await;
        loop {
            match run.finish(&ticket) {
                Completion::RunAgain(_) => {
                    tracing::debug!(session = %ticket.session, "Running pending reload");
                    outcome = self.reload_once(&ticket).await;
                }
                Completion::Idle | Completion::Stale => break,
            }
        }
        outcome
    }

    /// Replace the window with a fresh load of the newest messages
    pub async fn full_reload(&self) -> ReloadOutcome {
        let Some(ticket) = self.inner.state.lock().ticket() else {
            return ReloadOutcome::NoSession;
        };
        let result = self.full_reload_for(&ticket).await;
        self.settle(&ticket, result)
    }

    async fn reload_once(&self, ticket: &SessionTicket) -> ReloadOutcome {
        let result = self.reconcile(ticket).await;
        self.settle(ticket, result)
    }

    /// Map a reconciliation result to an outcome and track consecutive failures
    fn settle(&self, ticket: &SessionTicket, result: CacheResult<ReloadOutcome>) -> ReloadOutcome {
        match result {
            Ok(outcome) => {
                let mut state = self.inner.state.lock();
                if state.is_current(ticket) && state.sync_failures > 0 {
                    state.sync_failures = 0;
                    self.inner.publish(&state);
                }
                outcome
            }
            Err(e) if e.is_superseded() => ReloadOutcome::Superseded,
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.is_current(ticket) {
                    state.sync_failures = state.sync_failures.saturating_add(1);
                    self.inner.publish(&state);
                }
                tracing::warn!(
                    session = %ticket.session,
                    error = %e,
                    failures = state.sync_failures,
                    "Reload failed (non-fatal)"
                );
                ReloadOutcome::Failed
            }
        }
    }

    async fn reconcile(&self, ticket: &SessionTicket) -> CacheResult<ReloadOutcome> {
        let meta = self.inner.api.session(&ticket.session).await;

        let (old_count, newest) = {
            let state = self.inner.state.lock();
            if !state.is_current(ticket) {
                return Err(CacheError::Superseded);
            }
            (state.message_count, state.window.newest())
        };
        let new_count = meta?.count();

        if new_count == old_count {
            tracing::trace!(session = %ticket.session, count = new_count, "Message count unchanged");
            return Ok(ReloadOutcome::Unchanged);
        }

        match newest {
            Some(newest) if new_count > old_count => {
                let appended = self.load_from(ticket, newest + 1).await?;

                let drifted = {
                    let mut state = self.inner.state.lock();
                    if !state.is_current(ticket) {
                        return Err(CacheError::Superseded);
                    }
                    let newest = state.window.newest();
                    if newest == Some(new_count - 1) {
                        state.message_count = new_count;
                        self.inner.publish(&state);
                        false
                    } else {
                        tracing::warn!(
                            session = %ticket.session,
                            expected = new_count - 1,
                            newest = ?newest,
                            "Incremental append drifted; doing full reload"
                        );
                        true
                    }
                };
                if drifted {
                    return self.full_reload_for(ticket).await;
                }
                tracing::debug!(session = %ticket.session, appended, count = new_count, "Appended new messages");
                Ok(ReloadOutcome::Appended { count: appended })
            }
            _ => {
                tracing::debug!(session = %ticket.session, old_count, new_count, "Message count shrank or window empty; full reload");
                self.full_reload_for(ticket).await
            }
        }
    }

    /// Append ascending pages starting at `from` until a short page.
    ///
    /// Each page is one swap of the window. A page that does not continue
    /// the window is cut at the gap and paging stops there.
    async fn load_from(&self, ticket: &SessionTicket, mut from: Ordinal) -> CacheResult<usize> {
        let batch = self.inner.config.batch_size;
        let mut appended = 0;

        loop {
            let page = self
                .inner
                .api
                .fetch(&ticket.session, FetchOptions::ascending(from, batch))
                .await;

            let mut state = self.inner.state.lock();
            if !state.is_current(ticket) {
                return Err(CacheError::Superseded);
            }
            let page = page?;
            let len = page.len();
            let Some(last) = page.messages.last().map(|m| m.ordinal) else {
                break;
            };

            let accepted = state.window.append(page.messages);
            appended += accepted;
            if accepted > 0 {
                self.inner.publish(&state);
            }
            tracing::trace!(session = %ticket.session, from, accepted, "Appended page");

            if accepted < len || len < batch {
                break;
            }
            from = last + 1;
        }
        Ok(appended)
    }

    async fn full_reload_for(&self, ticket: &SessionTicket) -> CacheResult<ReloadOutcome> {
        {
            let mut state = self.inner.state.lock();
            if !state.is_current(ticket) {
                return Err(CacheError::Superseded);
            }
            state.loading = true;
            self.inner.publish(&state);
        }

        let busy = BusyGuard::new(&self.inner, ticket.clone(), Busy::Loading);
        let result = self.load_progressively(ticket).await;
        busy.finish();
        let count = result?;
        tracing::debug!(session = %ticket.session, count, "Full reload complete");
        Ok(ReloadOutcome::FullReload { count })
    }
}

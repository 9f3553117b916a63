//! Background prefetch of history below the window
//!
//! After the initial window is loaded, all older messages are fetched in
//! ascending pages into a buffer the UI never sees. Scrolling back later
//! flushes the buffer into the window in one swap instead of waiting on the
//! network.
//!
//! A run is identified by the prefetch epoch it captured when it began.
//! Anything that moves the window's lower bound (a session switch, a full
//! reload, an interactive backfill) bumps the epoch and empties the buffer;
//! the old run notices on its next check and stops.

use transcript_core::{FetchOptions, Message, MessageApi, Ordinal};

use crate::cache::{MessageCache, SessionTicket};
use crate::epoch::Epoch;
use crate::error::{CacheError, CacheResult};

/// Visible progress of the prefetch engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrefetchStatus {
    /// No run in progress and no completed buffer
    #[default]
    Idle,
    /// A run is fetching pages
    Running,
    /// The buffer reaches ordinal 0 (it may already have been flushed)
    Complete,
}

/// Result of a prefetch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// Buffer is complete and holds `buffered` messages
    Complete { buffered: usize },
    /// Nothing below the window, or no session
    Skipped,
    /// Cancelled by a newer run or a structural change
    Superseded,
    /// A page fetch failed; the partial buffer is never flushed
    Failed,
}

/// What a run captured when it began
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrefetchRun {
    pub(crate) epoch: Epoch,
    /// Oldest window ordinal at start; only messages below it are buffered
    pub(crate) oldest: Ordinal,
}

#[derive(Debug, Default)]
pub(crate) struct PrefetchState {
    buffer: Vec<Message>,
    done: bool,
    running: bool,
    epoch: Epoch,
}

impl PrefetchState {
    /// Invalidate any run and drop the buffer
    pub(crate) fn cancel(&mut self) {
        self.epoch.bump();
        self.buffer.clear();
        self.done = false;
        self.running = false;
    }

    pub(crate) fn begin(&mut self, oldest: Ordinal) -> PrefetchRun {
        self.cancel();
        self.running = true;
        PrefetchRun {
            epoch: self.epoch,
            oldest,
        }
    }

    pub(crate) fn owns(&self, run: &PrefetchRun) -> bool {
        self.epoch == run.epoch
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn status(&self) -> PrefetchStatus {
        if self.running {
            PrefetchStatus::Running
        } else if self.done {
            PrefetchStatus::Complete
        } else {
            PrefetchStatus::Idle
        }
    }

    /// Take the buffer if the run finished and there is something in it
    pub(crate) fn take_complete(&mut self) -> Option<Vec<Message>> {
        if self.done && !self.buffer.is_empty() {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }
}

impl<A: MessageApi + 'static> MessageCache<A> {
    /// Fetch all history below the window into the prefetch buffer.
    ///
    /// Any earlier run is cancelled first. The window itself is never
    /// touched. Normally started automatically after a session loads.
    pub async fn prefetch_in_background(&self) -> PrefetchOutcome {
        let started = {
            let mut state = self.inner.state.lock();
            let ticket = state.ticket();
            let run = state.begin_prefetch();
            if run.is_some() {
                self.inner.publish(&state);
            }
            ticket.zip(run)
        };
        match started {
            Some((ticket, run)) => self.run_prefetch(ticket, run).await,
            None => PrefetchOutcome::Skipped,
        }
    }

    pub(crate) fn spawn_prefetch(&self, ticket: SessionTicket, run: PrefetchRun) {
        let cache = self.clone();
        tokio::spawn(async move {
            cache.run_prefetch(ticket, run).await;
        });
    }

    async fn run_prefetch(&self, ticket: SessionTicket, run: PrefetchRun) -> PrefetchOutcome {
        tracing::debug!(session = %ticket.session, below = run.oldest, epoch = %run.epoch, "Prefetch started");
        match self.prefetch_pages(&ticket, &run).await {
            Ok(buffered) => {
                tracing::debug!(session = %ticket.session, buffered, "Prefetch complete");
                PrefetchOutcome::Complete { buffered }
            }
            Err(e) if e.is_superseded() => {
                tracing::trace!(session = %ticket.session, epoch = %run.epoch, "Prefetch superseded");
                PrefetchOutcome::Superseded
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.is_current(&ticket) && state.prefetch.owns(&run) {
                    state.prefetch.running = false;
                    self.inner.publish(&state);
                }
                tracing::warn!(session = %ticket.session, error = %e, "Prefetch failed (non-fatal)");
                PrefetchOutcome::Failed
            }
        }
    }

    async fn prefetch_pages(&self, ticket: &SessionTicket, run: &PrefetchRun) -> CacheResult<usize> {
        let batch = self.inner.config.batch_size;
        let mut from: Ordinal = 0;

        loop {
            self.check_prefetch(ticket, run)?;
            let page = self
                .inner
                .api
                .fetch(&ticket.session, FetchOptions::ascending(from, batch))
                .await;

            let next = {
                let mut state = self.inner.state.lock();
                if !(state.is_current(ticket) && state.prefetch.owns(run)) {
                    return Err(CacheError::Superseded);
                }
                let page = page?;
                let len = page.len();
                let Some(last) = page.messages.last().map(|m| m.ordinal) else {
                    break;
                };
                state
                    .prefetch
                    .buffer
                    .extend(page.messages.into_iter().filter(|m| m.ordinal < run.oldest));
                self.inner.publish(&state);
                tracing::trace!(session = %ticket.session, from, last, buffered = state.prefetch.buffered(), "Prefetched page");

                if len < batch || last + 1 >= run.oldest {
                    None
                } else {
                    Some(last + 1)
                }
            };

            match next {
                Some(n) => from = n,
                None => break,
            }
        }

        let mut state = self.inner.state.lock();
        if !(state.is_current(ticket) && state.prefetch.owns(run)) {
            return Err(CacheError::Superseded);
        }
        state.prefetch.done = true;
        state.prefetch.running = false;
        self.inner.publish(&state);
        Ok(state.prefetch.buffered())
    }

    fn check_prefetch(&self, ticket: &SessionTicket, run: &PrefetchRun) -> CacheResult<()> {
        let state = self.inner.state.lock();
        if state.is_current(ticket) && state.prefetch.owns(run) {
            Ok(())
        } else {
            Err(CacheError::Superseded)
        }
    }
}

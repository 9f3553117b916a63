//! Background task that turns change notifications into reloads
//!
//! The watcher listens on two sources:
//! - an `mpsc` channel of [`ChangeSignal`]s from whatever push transport the
//!   host has (server-sent events, websocket, file watcher)
//! - a poll tick every `poll_interval`, covering missed or absent signals
//!
//! Each one triggers [`MessageCache::reload`]. Overlapping triggers are
//! coalesced by the reload supervisor, so a burst of signals costs at most
//! one extra pass.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use transcript_core::{MessageApi, SessionId};

use crate::cache::MessageCache;
use crate::reconcile::ReloadOutcome;

/// "Something changed" notification
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeSignal {
    /// Session the change belongs to; `None` means any session
    pub session: Option<SessionId>,
}

impl ChangeSignal {
    pub fn any() -> Self {
        Self { session: None }
    }

    pub fn for_session(session: impl Into<SessionId>) -> Self {
        Self {
            session: Some(session.into()),
        }
    }

    fn concerns(&self, active: Option<&SessionId>) -> bool {
        match (&self.session, active) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(signal), Some(active)) => signal == active,
        }
    }
}

/// Handle to a running watcher task
pub struct SessionWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SessionWatcher {
    /// Spawn a watcher for `cache`, polling at the cache's configured interval
    pub fn spawn<A: MessageApi + 'static>(
        cache: MessageCache<A>,
        signals: mpsc::Receiver<ChangeSignal>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(cache, signals, cancel.clone()));
        Self { cancel, handle }
    }

    /// Token that stops the watcher when cancelled
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the watcher and wait for it to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Session watcher task ended abnormally");
        }
    }
}

async fn run<A: MessageApi + 'static>(
    cache: MessageCache<A>,
    mut signals: mpsc::Receiver<ChangeSignal>,
    cancel: CancellationToken,
) {
    let period = cache.config().poll_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut signals_open = true;

    info!(?period, "Session watcher started");

    loop {
        let trigger = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => "poll",
            signal = signals.recv(), if signals_open => match signal {
                Some(signal) if signal.concerns(cache.session().as_ref()) => "signal",
                Some(signal) => {
                    trace!(session = ?signal.session, "Ignoring change signal for inactive session");
                    continue;
                }
                None => {
                    debug!("Change signal channel closed; polling only");
                    signals_open = false;
                    continue;
                }
            },
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = cache.reload() => outcome,
        };
        match outcome {
            ReloadOutcome::NoSession | ReloadOutcome::Unchanged => {
                trace!(trigger, ?outcome, "Reload pass")
            }
            _ => debug!(trigger, ?outcome, "Reload pass"),
        }
    }

    info!("Session watcher stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use transcript_core::{MockCall, MockMessageApi};

    use super::*;
    use crate::CacheConfig;

    fn session_calls(api: &MockMessageApi) -> usize {
        api.calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Session { .. }))
            .count()
    }

    async fn setup(
        poll: Duration,
    ) -> (Arc<MockMessageApi>, MessageCache<MockMessageApi>, SessionId) {
        let api = Arc::new(MockMessageApi::new());
        let id = SessionId::new("s1");
        api.insert_session(&id, 20);
        let config = CacheConfig::testing().with_poll_interval(poll);
        let cache = MessageCache::with_config(api.clone(), config).unwrap();
        cache.load_session(id.clone()).await;
        (api, cache, id)
    }

    async fn wait_for_count(cache: &MessageCache<MockMessageApi>, count: u64) {
        let mut rx = cache.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.message_count == count),
        )
        .await
        .expect("timed out waiting for message count")
        .unwrap();
    }

    #[test]
    fn test_signal_scope() {
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        assert!(ChangeSignal::any().concerns(Some(&a)));
        assert!(ChangeSignal::for_session("a").concerns(Some(&a)));
        assert!(!ChangeSignal::for_session("a").concerns(Some(&b)));
        assert!(!ChangeSignal::any().concerns(None));
    }

    #[tokio::test]
    async fn test_signal_triggers_reload() {
        let (api, cache, id) = setup(Duration::from_secs(3600)).await;
        let (tx, rx) = mpsc::channel(8);
        let watcher = SessionWatcher::spawn(cache.clone(), rx);

        api.append(&id, 3);
        tx.send(ChangeSignal::for_session(id.clone())).await.unwrap();
        wait_for_count(&cache, 23).await;
        assert_eq!(cache.messages().len(), 23);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_signal_for_other_session_is_ignored() {
        let (api, cache, id) = setup(Duration::from_secs(3600)).await;
        let (tx, rx) = mpsc::channel(8);
        let watcher = SessionWatcher::spawn(cache.clone(), rx);
        api.clear_calls();

        api.append(&id, 1);
        tx.send(ChangeSignal::for_session("other")).await.unwrap();
        tx.send(ChangeSignal::any()).await.unwrap();
        wait_for_count(&cache, 21).await;

        assert_eq!(session_calls(&api), 1);
        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_tick_triggers_reload() {
        let (api, cache, id) = setup(Duration::from_millis(50)).await;
        let (_tx, rx) = mpsc::channel(8);
        let watcher = SessionWatcher::spawn(cache.clone(), rx);

        api.append(&id, 2);
        wait_for_count(&cache, 22).await;

        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_polling_after_channel_closes() {
        let (api, cache, id) = setup(Duration::from_millis(50)).await;
        let (tx, rx) = mpsc::channel(8);
        let watcher = SessionWatcher::spawn(cache.clone(), rx);
        drop(tx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!watcher.is_finished());

        api.append(&id, 4);
        wait_for_count(&cache, 24).await;

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_watcher() {
        let (_api, cache, _id) = setup(Duration::from_secs(3600)).await;
        let (_tx, rx) = mpsc::channel(8);
        let watcher = SessionWatcher::spawn(cache, rx);

        watcher.cancellation().cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !watcher.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("watcher should stop");
    }
}

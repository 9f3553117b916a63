//! Scripted runs of the message cache against a simulated remote log
//!
//! Each scenario builds an in-memory backend, drives the cache through a
//! sequence of user and remote actions, and records the window after every
//! step.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use tokio::sync::mpsc;
use tracing::info;
use transcript_cache::{
    CacheConfig, ChangeSignal, MessageCache, PrefetchStatus, SessionWatcher, WindowSnapshot,
};
use transcript_core::{MockMessageApi, SessionId};

use crate::report::StepReport;

/// How long to wait for background work before giving up
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters for [`run_walkthrough`]
#[derive(Debug, Clone)]
pub struct WalkthroughParams {
    /// Initial length of the remote log
    pub messages: u64,
    /// Messages appended remotely before the first reconcile
    pub append: u64,
    /// Rewrite the remote log to this many messages, then reconcile
    pub rewrite: Option<u64>,
    /// Jump to this ordinal with `ensure_ordinal_loaded`
    pub jump: Option<u64>,
}

/// Select a session, wait for prefetch, backfill, then follow remote changes.
pub async fn run_walkthrough(config: CacheConfig, params: &WalkthroughParams) -> Result<Vec<StepReport>> {
    info!(?params, "=== Running walkthrough ===");
    let api = Arc::new(MockMessageApi::new());
    let id = SessionId::new("sim");
    api.insert_session(&id, params.messages);

    let cache = MessageCache::with_config(api.clone(), config).context("invalid cache config")?;
    let mut reports = Vec::new();
    let mut record = |step: &str, snap: WindowSnapshot| -> Result<()> {
        let report = StepReport::capture(step, &snap);
        ensure!(report.contiguous, "window has a gap after {step}");
        println!("{report}");
        reports.push(report);
        Ok(())
    };

    let outcome = cache.load_session(id.clone()).await;
    info!(?outcome, "Session selected");
    record("load_session", cache.snapshot())?;

    if cache.has_older() {
        let snap = settle(&cache, |s| s.prefetch != PrefetchStatus::Running).await?;
        record("prefetch settled", snap)?;
    }

    let calls = api.call_count();
    let outcome = cache.load_older().await;
    info!(?outcome, fetches = api.call_count() - calls, "Backfilled one step");
    record("load_older", cache.snapshot())?;

    if let Some(target) = params.jump {
        let outcome = cache.ensure_ordinal_loaded(target).await;
        info!(?outcome, target, "Jumped");
        record(&format!("ensure_ordinal_loaded({target})"), cache.snapshot())?;
    }

    if params.append > 0 {
        api.append(&id, params.append);
        let outcome = cache.reload().await;
        info!(?outcome, appended = params.append, "Reconciled after remote append");
        record(&format!("append {} + reload", params.append), cache.snapshot())?;
    }

    if let Some(len) = params.rewrite {
        api.rewrite(&id, len);
        let outcome = cache.reload().await;
        info!(?outcome, len, "Reconciled after remote rewrite");
        record(&format!("rewrite {len} + reload"), cache.snapshot())?;
    }

    cache.clear();
    record("clear", cache.snapshot())?;
    Ok(reports)
}

/// Parameters for [`run_live`]
#[derive(Debug, Clone)]
pub struct LiveParams {
    /// Initial length of the remote log
    pub messages: u64,
    /// Number of remote append bursts
    pub bursts: u32,
    /// Messages per burst
    pub burst_size: u64,
    /// Signal every burst (otherwise rely on the poll tick)
    pub signal: bool,
}

/// Follow a growing remote log through the change-signal watcher.
pub async fn run_live(config: CacheConfig, params: &LiveParams) -> Result<Vec<StepReport>> {
    info!(?params, "=== Running live follow ===");
    let api = Arc::new(MockMessageApi::new());
    let id = SessionId::new("live");
    api.insert_session(&id, params.messages);

    let cache = MessageCache::with_config(api.clone(), config).context("invalid cache config")?;
    cache.load_session(id.clone()).await;

    let (tx, rx) = mpsc::channel(16);
    let watcher = SessionWatcher::spawn(cache.clone(), rx);

    let mut reports = vec![StepReport::capture("load_session", &cache.snapshot())];
    println!("{}", reports[0]);

    let mut expected = params.messages;
    for burst in 1..=params.bursts {
        api.append(&id, params.burst_size);
        expected += params.burst_size;
        if params.signal {
            tx.send(ChangeSignal::for_session(id.clone()))
                .await
                .context("watcher stopped")?;
        }
        let snap = settle(&cache, |s| s.message_count == expected).await?;
        let report = StepReport::capture(format!("burst {burst}"), &snap);
        println!("{report}");
        reports.push(report);
    }

    watcher.shutdown().await;
    Ok(reports)
}

async fn settle<A>(
    cache: &MessageCache<A>,
    mut done: impl FnMut(&WindowSnapshot) -> bool,
) -> Result<WindowSnapshot>
where
    A: transcript_core::MessageApi + 'static,
{
    let mut rx = cache.subscribe();
    let waited = tokio::time::timeout(SETTLE_TIMEOUT, rx.wait_for(|s| done(s))).await;
    match waited {
        Ok(Ok(snap)) => Ok(snap.clone()),
        Ok(Err(_)) => bail!("cache dropped while waiting"),
        Err(_) => bail!("timed out after {SETTLE_TIMEOUT:?} waiting for the cache to settle"),
    }
}

//! # Transcript Cache
//!
//! Client-side cache and synchronization engine for a session transcript
//! viewer. It keeps a contiguous, ordinal-indexed window over a remote,
//! append-mostly log coherent while a UI scrolls through it.
//!
//! ## Components
//!
//! - [`Window`]: The materialized, contiguous slice of the log
//! - Progressive loader ([`MessageCache::load_session`]): fetches the newest
//!   `first_batch` messages on session selection
//! - Prefetch engine ([`MessageCache::prefetch_in_background`]): fills an
//!   invisible buffer with all older history
//! - Backfill loader ([`MessageCache::load_older`],
//!   [`MessageCache::ensure_ordinal_loaded`]): extends the window backward,
//!   preferring the prefetch buffer over the network
//! - Reconciler ([`MessageCache::reload`]): incremental append or full
//!   reload after an external change signal
//! - [`SessionWatcher`]: turns poll ticks and change signals into reloads
//!
//! ## Cancellation
//!
//! Every asynchronous step captures an [`Epoch`] before it suspends and
//! compares it after it resumes. A mismatch means the work was superseded
//! and its result is dropped. In-flight requests are never aborted.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use transcript_cache::MessageCache;
//! use transcript_core::{MockMessageApi, SessionId};
//!
//! let api = Arc::new(MockMessageApi::new());
//! let cache = MessageCache::new(api);
//!
//! cache.load_session(SessionId::new("s1")).await;
//! let mut window = cache.subscribe();
//! println!("{} messages", window.borrow().messages.len());
//!
//! // User scrolled to the top
//! cache.load_older().await;
//! ```

pub mod backfill;
pub mod cache;
pub mod config;
pub mod epoch;
pub mod error;
pub mod prefetch;
pub mod reconcile;
pub mod supervisor;
pub mod watcher;
pub mod window;

// Re-exports
pub use backfill::BackfillOutcome;
pub use cache::{LoadOutcome, MessageCache, WindowSnapshot};
pub use config::CacheConfig;
pub use epoch::Epoch;
pub use error::{CacheError, CacheResult};
pub use prefetch::{PrefetchOutcome, PrefetchStatus};
pub use reconcile::ReloadOutcome;
pub use supervisor::{Admission, Completion, CycleWaiter, RunToken, SupervisorState, TaskSupervisor};
pub use watcher::{ChangeSignal, SessionWatcher};
pub use window::Window;

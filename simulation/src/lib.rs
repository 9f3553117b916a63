//! # Transcript Sim
//!
//! Scripted runs of the transcript message cache against an in-memory,
//! mutating remote log.
//!
//! - **Scenarios** (`scenarios.rs`): walkthrough (load, prefetch, backfill,
//!   append, rewrite, clear) and live follow through the watcher
//! - **Report** (`report.rs`): per-step window summaries

pub mod report;
pub mod scenarios;

pub use report::StepReport;
pub use scenarios::{LiveParams, WalkthroughParams, run_live, run_walkthrough};

//! Transcript cache simulator
//!
//! Drives the message cache against an in-memory remote log and prints the
//! window after each step.
//!
//! ```bash
//! # Load 1800 messages, backfill, append 5 remotely, reconcile
//! transcript-sim run --messages 1800 --append 5
//!
//! # Also rewrite the log to 300 messages and jump to ordinal 0 first
//! transcript-sim run --messages 5000 --append 12 --rewrite 300 --jump 0
//!
//! # Follow remote appends through the change-signal watcher
//! transcript-sim live --messages 200 --bursts 5 --burst-size 3
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use transcript_cache::CacheConfig;
use transcript_logging::{LogConfig, TranscriptSubscriberBuilder};
use transcript_sim::scenarios::{LiveParams, WalkthroughParams, run_live, run_walkthrough};

#[derive(Parser)]
#[command(
    name = "transcript-sim",
    about = "Message cache simulation against a mutating remote log",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Cache configuration (JSON); defaults apply to missing fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Logging configuration (JSON)
    #[arg(long, global = true)]
    log_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select a session, prefetch, backfill, then reconcile remote changes
    Run {
        /// Initial length of the remote log
        #[arg(short, long, default_value = "1800")]
        messages: u64,

        /// Messages appended remotely before reconciling
        #[arg(short, long, default_value = "5")]
        append: u64,

        /// Rewrite the remote log to this many messages and reconcile again
        #[arg(short, long)]
        rewrite: Option<u64>,

        /// Jump to this ordinal before reconciling
        #[arg(short, long)]
        jump: Option<u64>,
    },

    /// Follow a growing remote log through the watcher
    Live {
        /// Initial length of the remote log
        #[arg(short, long, default_value = "200")]
        messages: u64,

        /// Number of remote append bursts
        #[arg(short, long, default_value = "5")]
        bursts: u32,

        /// Messages per burst
        #[arg(long, default_value = "3")]
        burst_size: u64,

        /// Do not send change signals; rely on the poll tick
        #[arg(long)]
        poll_only: bool,
    },
}

fn load_log_config(cli: &Cli) -> Result<LogConfig> {
    match &cli.log_config {
        Some(path) => LogConfig::from_file(path)
            .with_context(|| format!("reading log config {}", path.display())),
        None => Ok(LogConfig::development().with_target("transcript_cache", "info")),
    }
}

fn load_cache_config(cli: &Cli) -> Result<CacheConfig> {
    match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading cache config {}", path.display()))?;
            CacheConfig::from_json_str(&json)
                .with_context(|| format!("parsing cache config {}", path.display()))
        }
        None => Ok(CacheConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = TranscriptSubscriberBuilder::new().with_config(load_log_config(&cli)?);
    if cli.verbose {
        logging = logging.with_level("debug");
    }
    let _guard = logging.init();
    let config = load_cache_config(&cli)?;

    match cli.command {
        Commands::Run {
            messages,
            append,
            rewrite,
            jump,
        } => {
            let params = WalkthroughParams {
                messages,
                append,
                rewrite,
                jump,
            };
            let reports = run_walkthrough(config, &params).await?;
            println!("\n{} steps, window contiguous throughout", reports.len());
        }
        Commands::Live {
            messages,
            bursts,
            burst_size,
            poll_only,
        } => {
            let params = LiveParams {
                messages,
                bursts,
                burst_size,
                signal: !poll_only,
            };
            let reports = run_live(config, &params).await?;
            if let Some(last) = reports.last() {
                println!("\nFollowed {} bursts; final count {}", bursts, last.message_count);
            }
        }
    }

    Ok(())
}

//! Structured logging setup for the transcript cache stack
//!
//! Installs a global `tracing` subscriber with:
//!
//! - **Console output**: JSONL (default) or pretty human-readable lines
//! - **File output**: JSONL with daily/hourly rotation via tracing-appender
//! - **Filtering**: a default level plus per-target levels; `RUST_LOG` wins
//!
//! # Quick Start
//!
//! ```ignore
//! use transcript_logging::{LogConfig, TranscriptSubscriberBuilder};
//!
//! // JSONL to the console
//! let _guard = TranscriptSubscriberBuilder::new().init();
//!
//! // Pretty output while developing
//! let _guard = TranscriptSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init();
//! ```
//!
//! Keep the returned guard alive when file output is enabled; dropping it
//! flushes and stops the background writer.

pub mod config;

pub use config::{ConsoleConfig, ConsoleFormat, FileConfig, LogConfig, RotationStrategy};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors from logging setup
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Log file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log rotation setup failed: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("Invalid filter directive: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Builder for configuring and initializing the global subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
pub struct TranscriptSubscriberBuilder {
    config: LogConfig,
}

impl TranscriptSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the base level and drop per-target levels
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self.config.targets.clear();
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Initialize the subscriber globally.
    ///
    /// Failures (bad directives, unwritable log directory, a subscriber
    /// already installed) are reported on stderr and leave logging as it
    /// was. Returns the file writer guard, if file output is enabled.
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: logging not initialized: {e}");
                None
            }
        }
    }

    /// Try to initialize the subscriber globally
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LogError> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.directives())?,
        };

        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            layers.push(self.console_layer());
        }
        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            layers.push(json_layer(writer));
            guard = Some(file_guard);
        }

        Registry::default()
            .with(layers)
            .with(filter)
            .try_init()
            .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

        tracing::debug!(
            console = self.config.console.enabled,
            file = guard.is_some(),
            "Logging initialized"
        );
        Ok(guard)
    }

    fn console_layer(&self) -> BoxedLayer {
        let console = &self.config.console;
        let writer = if console.stderr {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            BoxMakeWriter::new(std::io::stdout)
        };

        match console.format {
            ConsoleFormat::Pretty => tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
                .with_writer(writer)
                .boxed(),
            ConsoleFormat::Json => json_layer(writer),
        }
    }
}

/// Flattened JSONL with the current span and source location
fn json_layer<W>(writer: W) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(writer)
        .boxed()
}

impl Default for TranscriptSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking writer for `config`; truncates for `Never`, appends otherwise
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LogError> {
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            fs::create_dir_all(&config.directory)?;
            let path = config.directory.join(format!("{}.log", config.prefix));
            let file = File::create(path)?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(config.prefix.clone())
        .filename_suffix("log");
    if let Some(max) = config.max_files {
        builder = builder.max_log_files(max);
    }
    let appender = builder.build(&config.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging for tests; quietly does nothing if already set up
pub fn init_testing() {
    let _ = TranscriptSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}

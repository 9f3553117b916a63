//! One-line summaries of the cache window for the simulator output

use std::fmt;

use transcript_cache::{PrefetchStatus, WindowSnapshot};

/// What the window looked like after one simulator step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: String,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
    pub len: usize,
    pub message_count: u64,
    pub has_older: bool,
    pub prefetch: PrefetchStatus,
    pub prefetch_buffered: usize,
    pub revision: u64,
    pub contiguous: bool,
}

impl StepReport {
    pub fn capture(step: impl Into<String>, snap: &WindowSnapshot) -> Self {
        Self {
            step: step.into(),
            oldest: snap.oldest(),
            newest: snap.newest(),
            len: snap.messages.len(),
            message_count: snap.message_count,
            has_older: snap.has_older,
            prefetch: snap.prefetch,
            prefetch_buffered: snap.prefetch_buffered,
            revision: snap.revision,
            contiguous: transcript_core::is_contiguous(&snap.messages),
        }
    }
}

impl fmt::Display for StepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = match (self.oldest, self.newest) {
            (Some(oldest), Some(newest)) => format!("{oldest}..={newest}"),
            _ => "empty".to_string(),
        };
        write!(
            f,
            "{:<28} window {:<14} len {:>6}  count {:>6}  older {:<5}  prefetch {:?}({})  rev {}",
            self.step,
            range,
            self.len,
            self.message_count,
            self.has_older,
            self.prefetch,
            self.prefetch_buffered,
            self.revision,
        )?;
        if !self.contiguous {
            write!(f, "  GAP")?;
        }
        Ok(())
    }
}

//! Progress sink seam.
//!
//! The pipeline reports byte/row milestones through this interface and never
//! talks to a terminal or renderer directly.

use crate::types::FileOutcome;
use std::fmt;
use std::path::Path;

/// Pipeline phase a progress event is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Analyzing,
    ValidatingFile,
    Compressing,
    Uploading,
    Copying,
    ValidatingWarehouse,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Analyzing => "analyzing",
            Phase::ValidatingFile => "validating_file",
            Phase::Compressing => "compressing",
            Phase::Uploading => "uploading",
            Phase::Copying => "copying",
            Phase::ValidatingWarehouse => "validating_warehouse",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Receives file-scoped lifecycle events and counters.
pub trait ProgressSink: Send + Sync {
    /// A phase began; `total` is bytes (or rows) when known up front.
    fn on_file_start(&self, path: &Path, phase: Phase, total: Option<u64>);

    /// Incremental progress within a phase, in bytes (or rows).
    fn on_progress(&self, path: &Path, phase: Phase, delta: u64);

    /// The file reached a terminal outcome.
    fn on_file_end(&self, path: &Path, outcome: &FileOutcome);
}

/// Logging shape: one tracing line per milestone.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_file_start(&self, path: &Path, phase: Phase, total: Option<u64>) {
        match total {
            Some(total) => {
                tracing::info!(file = %path.display(), %phase, total, "phase started")
            }
            None => tracing::info!(file = %path.display(), %phase, "phase started"),
        }
    }

    fn on_progress(&self, path: &Path, phase: Phase, delta: u64) {
        tracing::debug!(file = %path.display(), %phase, delta, "progress");
    }

    fn on_file_end(&self, path: &Path, outcome: &FileOutcome) {
        tracing::info!(file = %path.display(), outcome = %outcome.summary(), "file finished");
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_file_start(&self, _path: &Path, _phase: Phase, _total: Option<u64>) {}
    fn on_progress(&self, _path: &Path, _phase: Phase, _delta: u64) {}
    fn on_file_end(&self, _path: &Path, _outcome: &FileOutcome) {}
}

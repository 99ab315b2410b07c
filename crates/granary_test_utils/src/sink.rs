//! Progress sink that records every event for assertions.

use granary_protocol::progress::{Phase, ProgressSink};
use granary_protocol::types::FileOutcome;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Start {
        path: PathBuf,
        phase: Phase,
        total: Option<u64>,
    },
    Progress {
        path: PathBuf,
        phase: Phase,
        delta: u64,
    },
    End {
        path: PathBuf,
        outcome: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Phases that started, in order, for one file.
    pub fn phases_for(&self, path: &Path) -> Vec<Phase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Start { path: p, phase, .. } if p == path => Some(phase),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for CollectingSink {
    fn on_file_start(&self, path: &Path, phase: Phase, total: Option<u64>) {
        self.events.lock().unwrap().push(SinkEvent::Start {
            path: path.to_path_buf(),
            phase,
            total,
        });
    }

    fn on_progress(&self, path: &Path, phase: Phase, delta: u64) {
        self.events.lock().unwrap().push(SinkEvent::Progress {
            path: path.to_path_buf(),
            phase,
            delta,
        });
    }

    fn on_file_end(&self, path: &Path, outcome: &FileOutcome) {
        self.events.lock().unwrap().push(SinkEvent::End {
            path: path.to_path_buf(),
            outcome: outcome.summary(),
        });
    }
}

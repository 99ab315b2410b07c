//! Job orchestration.
//!
//! A worker pool of OS threads consumes file descriptors in submission
//! order; each worker drives one file end-to-end through the phase machine
//! and reports a terminal outcome over a single collector channel. Workers
//! share nothing but the session pool and the progress sink.

mod worker;

use chrono::NaiveDate;
use granary_protocol::cancel::CancelToken;
use granary_protocol::config::{ConfigError, JobConfig};
use granary_protocol::progress::ProgressSink;
use granary_protocol::types::{FileDescriptor, FileOutcome, JobReport, JobWarning, StageHandle};
use granary_warehouse::completeness::CompletenessValidator;
use granary_warehouse::pool::ConnectionPool;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use tracing::{info, warn};

/// One orchestrator request: files, an optional completeness window, and
/// the job tunables.
#[derive(Debug, Clone)]
pub struct Job {
    pub files: Vec<FileDescriptor>,
    pub window: Option<(NaiveDate, NaiveDate)>,
    pub config: JobConfig,
}

/// Everything one file's terminal state produced.
pub(crate) struct FileResult {
    index: usize,
    path: PathBuf,
    outcome: FileOutcome,
    warnings: Vec<JobWarning>,
    recovery: Option<StageHandle>,
}

/// Drives jobs to completion with bounded concurrency and partial-failure
/// isolation.
pub struct LoadOrchestrator {
    pool: ConnectionPool,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
}

impl LoadOrchestrator {
    pub fn new(pool: ConnectionPool, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            pool,
            sink,
            cancel: CancelToken::new(),
        }
    }

    /// Handle for cancelling the running job from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run a job to completion. Configuration problems fail the whole job
    /// before any file is touched; everything after that is per-file.
    pub fn run(&self, job: Job) -> Result<JobReport, ConfigError> {
        job.config.validate()?;
        for fd in &job.files {
            job.config.validate_descriptor(fd)?;
        }

        let workers = job
            .config
            .effective_workers()
            .min(self.pool.capacity())
            .max(1);
        info!(files = job.files.len(), workers, "job starting");

        let completeness = CompletenessValidator::new();
        let queue: Mutex<VecDeque<(usize, FileDescriptor)>> =
            Mutex::new(job.files.iter().cloned().enumerate().collect());
        let (tx, rx) = mpsc::channel::<FileResult>();

        let ctx = worker::WorkerContext {
            config: &job.config,
            window: job.window,
            pool: &self.pool,
            sink: self.sink.as_ref(),
            cancel: &self.cancel,
            completeness: &completeness,
        };

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let ctx = &ctx;
                let cancel = &self.cancel;
                let continue_on_error = job.config.continue_on_error;
                scope.spawn(move || loop {
                    let next = queue.lock().expect("queue lock poisoned").pop_front();
                    let Some((index, fd)) = next else { break };
                    let result = worker::process_file(index, fd, ctx);
                    let failed = result.outcome.is_failure();
                    if tx.send(result).is_err() {
                        break;
                    }
                    if failed && !continue_on_error {
                        warn!("a file failed and continue_on_error is off; cancelling the job");
                        cancel.cancel();
                    }
                });
            }
            drop(tx);
        });

        let mut results: Vec<FileResult> = rx.into_iter().collect();
        results.sort_by_key(|r| r.index);

        let mut report = JobReport::default();
        for result in results {
            report.warnings.extend(result.warnings);
            if let Some(stage) = result.recovery {
                warn!(stage = %stage.path(), "stage left behind; recorded for recovery");
                report.recovery.push(stage);
            }
            report.outcomes.push((result.path, result.outcome));
        }
        info!(
            loaded = report.loaded_files(),
            failed = report.failed_files(),
            rows = report.total_rows_loaded(),
            "job finished"
        );
        Ok(report)
    }
}

//! Stage-and-copy loader for one analyzed file.
//!
//! Phase order: compress, stage create, parallel part upload, COPY (async
//! above the size threshold, with keepalive and polling), unconditional
//! stage cleanup. Transient session failures are retried on a fresh lease;
//! a known query id is re-polled rather than resubmitted.

use crate::copy;
use crate::ident::validate_identifier;
use crate::pool::{ConnectionPool, PoolError, PooledSession};
use crate::session::{CopyStatus, Session, SessionError};
use flate2::write::GzEncoder;
use granary_protocol::cancel::CancelToken;
use granary_protocol::defaults::{
    DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_ASYNC_THRESHOLD_BYTES, DEFAULT_COMPRESSION_LEVEL,
    DEFAULT_KEEPALIVE_INTERVAL_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_WAIT_SECS,
    DEFAULT_PARALLEL_UPLOADS, DEFAULT_POLL_INTERVAL_SECS, PROGRESS_CHUNK_BYTES, UPLOAD_PART_BYTES,
};
use granary_protocol::config::JobConfig;
use granary_protocol::progress::{Phase, ProgressSink};
use granary_protocol::types::{AnalysisReport, QueryId, ResolvedInput, StageHandle};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Cancellation is checked at this granularity while waiting out a poll tick.
const POLL_SLICE: Duration = Duration::from_millis(250);

const GZ_PROBE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    Io,
    ConnectionLost,
    Server,
    Timeout,
    Cancelled,
}

/// Structured load failure: classification, one-line message, the server
/// query id when known, and the stage handle when cleanup did not succeed.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub message: String,
    pub query_id: Option<QueryId>,
    pub recovery: Option<StageHandle>,
}

impl LoadError {
    fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            query_id: None,
            recovery: None,
        }
    }

    fn with_query_id(mut self, id: QueryId) -> Self {
        self.query_id = Some(id);
        self
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::new(
            LoadErrorKind::Io,
            format!("{}: {}", path.display(), source),
        )
    }

    fn from_session(error: SessionError) -> Self {
        match error {
            SessionError::ConnectionLost(m) => Self::new(LoadErrorKind::ConnectionLost, m),
            SessionError::Server { code, message } => Self::new(
                LoadErrorKind::Server,
                format!("server error {code}: {message}"),
            ),
            SessionError::Closed => {
                Self::new(LoadErrorKind::ConnectionLost, "session closed".to_string())
            }
        }
    }

    fn from_pool(error: PoolError) -> Self {
        match error {
            PoolError::AcquireTimeout(t) => Self::new(
                LoadErrorKind::Timeout,
                format!("no warehouse session available within {t:?}"),
            ),
            PoolError::Closed => Self::new(LoadErrorKind::Cancelled, "session pool closed"),
            PoolError::Connect(e) => Self::from_session(e),
        }
    }
}

/// Client-side handle for an in-flight async COPY.
#[derive(Debug, Clone)]
pub struct CopyTicket {
    pub query_id: QueryId,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub last_status: Option<CopyStatus>,
}

impl CopyTicket {
    fn new(query_id: QueryId, max_wait: Duration) -> Self {
        let submitted_at = Instant::now();
        Self {
            query_id,
            submitted_at,
            deadline: submitted_at + max_wait,
            last_status: None,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Result of one successful load.
#[derive(Debug, Clone)]
pub struct LoadReceipt {
    pub rows_loaded: u64,
    pub stage: StageHandle,
    pub compressed_bytes: u64,
    pub query_id: Option<QueryId>,
    /// Stage cleanup failed; the handle needs operator follow-up.
    pub cleanup_failed: bool,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub compression_level: u32,
    pub parallel_uploads: usize,
    pub upload_part_bytes: usize,
    pub async_threshold_bytes: u64,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub keepalive_interval: Duration,
    pub acquire_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            parallel_uploads: DEFAULT_PARALLEL_UPLOADS,
            upload_part_bytes: UPLOAD_PART_BYTES,
            async_threshold_bytes: DEFAULT_ASYNC_THRESHOLD_BYTES,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_wait: Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl LoaderConfig {
    pub fn from_job(config: &JobConfig) -> Self {
        Self {
            compression_level: config.compression_level,
            parallel_uploads: config.parallel_uploads,
            upload_part_bytes: UPLOAD_PART_BYTES,
            async_threshold_bytes: config.async_threshold_bytes,
            poll_interval: config.poll_interval(),
            max_wait: config.max_wait(),
            keepalive_interval: config.keepalive_interval(),
            acquire_timeout: config.acquire_timeout(),
            max_attempts: config.max_attempts,
        }
    }
}

/// Moves one analyzed file into its warehouse table.
pub struct WarehouseLoader<'a> {
    pool: &'a ConnectionPool,
    config: LoaderConfig,
}

impl<'a> WarehouseLoader<'a> {
    pub fn new(pool: &'a ConnectionPool, config: LoaderConfig) -> Self {
        Self { pool, config }
    }

    pub fn load(
        &self,
        input: &ResolvedInput,
        analysis: &AnalysisReport,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<LoadReceipt, LoadError> {
        let fd = &input.descriptor;
        let path = fd.path.as_path();

        validate_identifier(&fd.table).map_err(|e| {
            LoadError::new(LoadErrorKind::Server, format!("bad table name: {e}"))
        })?;
        self.check_cancel(cancel)?;

        // Phase: compress
        sink.on_file_start(path, Phase::Compressing, Some(analysis.file_bytes));
        let staged_file = self.ensure_gzipped(input, sink)?;
        let compressed_bytes = std::fs::metadata(&staged_file)
            .map_err(|e| LoadError::io(&staged_file, e))?
            .len();
        self.check_cancel(cancel)?;

        // Phase: stage + upload
        let mut lease = self
            .pool
            .acquire(self.config.acquire_timeout)
            .map_err(LoadError::from_pool)?;
        let mut stage = StageHandle::new(&fd.table);
        info!(file = %path.display(), stage = %stage.path(), "stage created");

        sink.on_file_start(path, Phase::Uploading, Some(compressed_bytes));
        match self.upload(lease.session(), &staged_file, &stage, cancel, sink, path) {
            Ok(parts) => stage.uploaded_parts = parts,
            Err(e) => return Err(self.fail_with_cleanup(&lease, &stage, e)),
        }
        if cancel.is_cancelled() {
            return Err(self.fail_with_cleanup(
                &lease,
                &stage,
                LoadError::new(LoadErrorKind::Cancelled, "job cancelled"),
            ));
        }

        // Phase: copy
        sink.on_file_start(path, Phase::Copying, None);
        let sql = copy::copy_into(&fd.table, &stage.path(), &input.format, fd.skip_header);
        let copied = if compressed_bytes >= self.config.async_threshold_bytes {
            self.copy_async(&mut lease, &sql, cancel, path)
        } else {
            self.copy_sync(&mut lease, &sql)
        };
        let (rows_loaded, query_id) = match copied {
            Ok(v) => v,
            Err(e) => return Err(self.fail_with_cleanup(&lease, &stage, e)),
        };

        if rows_loaded != analysis.row_count {
            let mut error = LoadError::new(
                LoadErrorKind::Server,
                format!(
                    "COPY reported {rows_loaded} rows but analysis counted {}",
                    analysis.row_count
                ),
            );
            if let Some(id) = &query_id {
                error = error.with_query_id(id.clone());
            }
            return Err(self.fail_with_cleanup(&lease, &stage, error));
        }

        // Phase: cleanup (PURGE removed staged files on success; the REMOVE
        // is still issued so nothing survives a partial purge)
        let cleanup_failed = !self.cleanup(lease.session(), &stage);
        info!(file = %path.display(), rows_loaded, "load complete");

        Ok(LoadReceipt {
            rows_loaded,
            stage,
            compressed_bytes,
            query_id,
            cleanup_failed,
        })
    }

    fn check_cancel(&self, cancel: &CancelToken) -> Result<(), LoadError> {
        if cancel.is_cancelled() {
            Err(LoadError::new(LoadErrorKind::Cancelled, "job cancelled"))
        } else {
            Ok(())
        }
    }

    /// Remove the stage prefix; failures are logged, never escalated.
    fn cleanup(&self, session: &Arc<dyn Session>, stage: &StageHandle) -> bool {
        match session.execute(&copy::remove_stage(&stage.path()), &[]) {
            Ok(_) => true,
            Err(e) => {
                warn!(stage = %stage.path(), error = %e, "stage cleanup failed");
                false
            }
        }
    }

    fn fail_with_cleanup(
        &self,
        lease: &PooledSession,
        stage: &StageHandle,
        mut error: LoadError,
    ) -> LoadError {
        if !self.cleanup(lease.session(), stage) {
            error.recovery = Some(stage.clone());
        }
        error
    }

    /// Produce the gzipped file to stage: pass through already-compressed
    /// input, reuse a valid sibling `.gz`, or compress fresh.
    fn ensure_gzipped(
        &self,
        input: &ResolvedInput,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf, LoadError> {
        let path = input.descriptor.path.as_path();
        if input.format.compression.is_gzip() {
            return Ok(path.to_path_buf());
        }

        let gz_path = PathBuf::from(format!("{}.gz", path.display()));
        if gz_path.exists() {
            if is_valid_gzip(&gz_path) {
                info!(file = %gz_path.display(), "reusing existing compressed file");
                return Ok(gz_path);
            }
            warn!(file = %gz_path.display(), "existing .gz failed integrity check; recompressing");
        }

        let mut source = File::open(path).map_err(|e| LoadError::io(path, e))?;
        let target = File::create(&gz_path).map_err(|e| LoadError::io(&gz_path, e))?;
        let mut encoder = GzEncoder::new(
            BufWriter::new(target),
            flate2::Compression::new(self.config.compression_level),
        );

        let mut buf = vec![0u8; 1024 * 1024];
        let mut processed = 0u64;
        let mut reported = 0u64;
        loop {
            let n = source.read(&mut buf).map_err(|e| LoadError::io(path, e))?;
            if n == 0 {
                break;
            }
            encoder
                .write_all(&buf[..n])
                .map_err(|e| LoadError::io(&gz_path, e))?;
            processed += n as u64;
            if processed - reported >= PROGRESS_CHUNK_BYTES {
                sink.on_progress(path, Phase::Compressing, processed - reported);
                reported = processed;
            }
        }
        encoder
            .finish()
            .and_then(|w| w.into_inner().map_err(|e| e.into_error()))
            .and_then(|f| f.sync_all())
            .map_err(|e| LoadError::io(&gz_path, e))?;
        if processed > reported {
            sink.on_progress(path, Phase::Compressing, processed - reported);
        }
        Ok(gz_path)
    }

    /// Chunked parallel upload of one file into the stage.
    fn upload(
        &self,
        session: &Arc<dyn Session>,
        file: &Path,
        stage: &StageHandle,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
        progress_path: &Path,
    ) -> Result<u32, LoadError> {
        let mut source = File::open(file).map_err(|e| LoadError::io(file, e))?;
        let stage_path = stage.path();
        let parts_done = AtomicU32::new(0);
        let upload_error: Mutex<Option<SessionError>> = Mutex::new(None);
        let read_error: Mutex<Option<std::io::Error>> = Mutex::new(None);

        let (tx, rx) = mpsc::sync_channel::<(u32, Vec<u8>)>(self.config.parallel_uploads);
        let rx = Arc::new(Mutex::new(rx));

        std::thread::scope(|scope| {
            for _ in 0..self.config.parallel_uploads {
                let rx = Arc::clone(&rx);
                let upload_error = &upload_error;
                let parts_done = &parts_done;
                let stage_path = stage_path.as_str();
                scope.spawn(move || loop {
                    let message = {
                        let rx = rx.lock().expect("upload queue lock poisoned");
                        rx.recv()
                    };
                    let (index, bytes) = match message {
                        Ok(m) => m,
                        Err(_) => break,
                    };
                    if upload_error.lock().expect("upload error lock poisoned").is_some() {
                        continue; // drain remaining parts after a failure
                    }
                    let name = format!("part_{index:05}.gz");
                    match session.upload_part(stage_path, &name, &bytes) {
                        Ok(()) => {
                            parts_done.fetch_add(1, Ordering::SeqCst);
                            sink.on_progress(progress_path, Phase::Uploading, bytes.len() as u64);
                        }
                        Err(e) => {
                            let mut slot =
                                upload_error.lock().expect("upload error lock poisoned");
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                });
            }

            let mut index = 0u32;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                if upload_error
                    .lock()
                    .expect("upload error lock poisoned")
                    .is_some()
                {
                    break;
                }
                let mut chunk = Vec::with_capacity(self.config.upload_part_bytes);
                let n = (&mut source)
                    .take(self.config.upload_part_bytes as u64)
                    .read_to_end(&mut chunk);
                match n {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send((index, chunk)).is_err() {
                            break;
                        }
                        index += 1;
                    }
                    Err(e) => {
                        *read_error.lock().expect("read error lock poisoned") = Some(e);
                        break;
                    }
                }
            }
            drop(tx);
        });

        if let Some(e) = read_error.into_inner().expect("read error lock poisoned") {
            return Err(LoadError::io(file, e));
        }
        if cancel.is_cancelled() {
            return Err(LoadError::new(LoadErrorKind::Cancelled, "job cancelled"));
        }
        if let Some(e) = upload_error.into_inner().expect("upload error lock poisoned") {
            return Err(LoadError::from_session(e));
        }
        Ok(parts_done.load(Ordering::SeqCst))
    }

    fn copy_sync(
        &self,
        lease: &mut PooledSession,
        sql: &str,
    ) -> Result<(u64, Option<QueryId>), LoadError> {
        let mut attempts = 1u32;
        loop {
            match lease.session().execute(sql, &[]) {
                Ok(result) => return Ok((result.rows_loaded, None)),
                Err(e) if e.is_transient() && attempts < self.config.max_attempts => {
                    attempts += 1;
                    warn!(error = %e, attempts, "COPY failed on a transient error; retrying on a fresh session");
                    lease.mark_unhealthy();
                    *lease = self
                        .pool
                        .acquire(self.config.acquire_timeout)
                        .map_err(LoadError::from_pool)?;
                }
                Err(e) => return Err(LoadError::from_session(e)),
            }
        }
    }

    fn copy_async(
        &self,
        lease: &mut PooledSession,
        sql: &str,
        cancel: &CancelToken,
        path: &Path,
    ) -> Result<(u64, Option<QueryId>), LoadError> {
        let mut attempts = 1u32;
        let mut keepalive = Some(lease.start_keepalive(self.config.keepalive_interval));

        let query_id = loop {
            match lease.session().submit_async(sql) {
                Ok(id) => break id,
                Err(e) if e.is_transient() && attempts < self.config.max_attempts => {
                    attempts += 1;
                    warn!(error = %e, attempts, "async COPY submission lost; retrying on a fresh session");
                    keepalive = None;
                    lease.mark_unhealthy();
                    *lease = self
                        .pool
                        .acquire(self.config.acquire_timeout)
                        .map_err(LoadError::from_pool)?;
                    keepalive = Some(lease.start_keepalive(self.config.keepalive_interval));
                }
                Err(e) => return Err(LoadError::from_session(e)),
            }
        };
        info!(file = %path.display(), query_id = %query_id, "COPY submitted asynchronously");
        let mut ticket = CopyTicket::new(query_id, self.config.max_wait);

        loop {
            // wait out one poll interval, staying responsive to cancellation
            let wake = Instant::now() + self.config.poll_interval;
            loop {
                let now = Instant::now();
                if cancel.is_cancelled() || now >= wake || ticket.expired() {
                    break;
                }
                std::thread::sleep(POLL_SLICE.min(wake - now));
            }
            if cancel.is_cancelled() {
                // best effort; past the point of no return the server decides
                let _ = lease.session().abort_query(&ticket.query_id);
                return Err(
                    LoadError::new(LoadErrorKind::Cancelled, "job cancelled during COPY")
                        .with_query_id(ticket.query_id),
                );
            }
            if ticket.expired() {
                return Err(LoadError::new(
                    LoadErrorKind::Timeout,
                    format!(
                        "COPY exceeded max wait of {:?}; server query left running",
                        self.config.max_wait
                    ),
                )
                .with_query_id(ticket.query_id));
            }

            let status = match lease.session().copy_status(&ticket.query_id) {
                Ok(status) => status,
                Err(e) if e.is_transient() && attempts < self.config.max_attempts => {
                    attempts += 1;
                    warn!(
                        error = %e,
                        query_id = %ticket.query_id,
                        "connection lost during COPY poll; resuming on a fresh session"
                    );
                    keepalive = None;
                    lease.mark_unhealthy();
                    *lease = self
                        .pool
                        .acquire(self.config.acquire_timeout)
                        .map_err(LoadError::from_pool)?;
                    keepalive = Some(lease.start_keepalive(self.config.keepalive_interval));
                    continue;
                }
                Err(e) => {
                    return Err(LoadError::from_session(e).with_query_id(ticket.query_id))
                }
            };
            ticket.last_status = Some(status.clone());
            match status {
                CopyStatus::Running => continue,
                CopyStatus::Success { rows_loaded } => {
                    return Ok((rows_loaded, Some(ticket.query_id)));
                }
                CopyStatus::Failed { code, message } => {
                    return Err(LoadError::new(
                        LoadErrorKind::Server,
                        format!("COPY failed with {code}: {message}"),
                    )
                    .with_query_id(ticket.query_id));
                }
                CopyStatus::Cancelled => {
                    return Err(LoadError::new(
                        LoadErrorKind::Cancelled,
                        "COPY cancelled on the server",
                    )
                    .with_query_id(ticket.query_id));
                }
            }
        }
    }
}

fn is_valid_gzip(path: &Path) -> bool {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut decoder = flate2::read::MultiGzDecoder::new(file).take(GZ_PROBE_BYTES);
    let mut probe = Vec::new();
    match decoder.read_to_end(&mut probe) {
        Ok(n) => n > 0,
        Err(_) => false,
    }
}

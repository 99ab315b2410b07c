//! Canonical default values and retention caps shared across the pipeline.

/// Per-job file worker count.
pub const DEFAULT_WORKERS: usize = 4;
/// Warehouse session pool size.
pub const DEFAULT_POOL_CAPACITY: usize = 10;
/// Compressed size above which COPY is submitted asynchronously.
pub const DEFAULT_ASYNC_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
/// Seconds between COPY status polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
/// Hard ceiling on a single COPY, in seconds.
pub const DEFAULT_MAX_WAIT_SECS: u64 = 2 * 60 * 60;
/// Seconds between keepalive pings on a session holding an async query.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 240;
/// Gzip level for the pre-stage compression pass.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;
/// Parallel part uploads per file.
pub const DEFAULT_PARALLEL_UPLOADS: usize = 4;
/// Session acquire timeout, in seconds.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 60;

/// Progress is reported to the sink in increments of this many bytes.
pub const PROGRESS_CHUNK_BYTES: u64 = 16 * 1024 * 1024;
/// Stage upload part size.
pub const UPLOAD_PART_BYTES: usize = 16 * 1024 * 1024;

/// Retained samples for row-level anomalies and invalid dates.
pub const ROW_SAMPLE_CAP: usize = 1_000;
/// Retained sample row indices per duplicate group.
pub const DUPLICATE_SAMPLE_CAP: usize = 10;

/// Non-empty lines sampled during format detection.
pub const FORMAT_SAMPLE_LINES: usize = 64;
/// Detection confidence below this triggers an analyzer warning.
pub const CONFIDENCE_WARN_THRESHOLD: f64 = 0.5;

/// SIZE_LIMIT passed to COPY (5 GiB).
pub const COPY_SIZE_LIMIT_BYTES: u64 = 5_368_709_120;

/// Retries for a COPY interrupted by a transient session failure.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

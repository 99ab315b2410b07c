//! Canonical types shared across the Granary load pipeline.
//!
//! Everything downstream crates exchange lives here: file descriptors and
//! resolved formats, the analysis/quality/completeness reports, per-file
//! outcomes, job configuration, and the progress sink seam.

pub mod cancel;
pub mod config;
pub mod dates;
pub mod defaults;
pub mod progress;
pub mod stats;
pub mod types;

pub use cancel::CancelToken;
pub use config::{ConfigError, JobConfig, SeverityConfig};
pub use progress::{Phase, ProgressSink};
pub use types::{
    AnalysisReport, CompletenessReport, Compression, DateAnomaly, DuplicateGroup, EscapeStyle,
    FailureDetail, FailureKind, FileDescriptor, FileOutcome, Format, FormatKind, GapRange,
    JobReport, JobWarning, LineTerminator, QualityReport, QueryId, ResolvedInput, RowAnomaly,
    Severity, SkipReason, StageHandle, ValidationFailure, ValidationPolicy,
};

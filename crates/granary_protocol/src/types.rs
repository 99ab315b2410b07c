//! Core pipeline entities: descriptors, formats, reports, outcomes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Input identity and format
// ============================================================================

/// Broad family of delimited format. Tab-separated input is `Tsv`; everything
/// else (comma, pipe, semicolon) is `Csv` and defaults to double-quote quoting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Tsv,
    Csv,
}

impl FormatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatKind::Tsv => "tsv",
            FormatKind::Csv => "csv",
        }
    }

    /// Kind implied by a delimiter byte.
    pub fn for_delimiter(delimiter: u8) -> Self {
        if delimiter == b'\t' {
            FormatKind::Tsv
        } else {
            FormatKind::Csv
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    pub fn is_gzip(&self) -> bool {
        matches!(self, Compression::Gzip)
    }
}

/// How a quote character inside a quoted field is escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EscapeStyle {
    /// `""` inside a quoted field (default).
    #[default]
    Doubling,
    /// `\"` inside a quoted field.
    Backslash,
}

/// Effective wire format of one input file. Resolved exactly once, before any
/// streaming read, and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub kind: FormatKind,
    pub delimiter: u8,
    pub quote: Option<u8>,
    pub compression: Compression,
}

impl Format {
    /// Format with the canonical quote default for the delimiter's kind.
    pub fn for_delimiter(delimiter: u8, compression: Compression) -> Self {
        let kind = FormatKind::for_delimiter(delimiter);
        let quote = match kind {
            FormatKind::Tsv => None,
            FormatKind::Csv => Some(b'"'),
        };
        Self {
            kind,
            delimiter,
            quote,
            compression,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delim = match self.delimiter {
            b'\t' => "\\t".to_string(),
            d => (d as char).to_string(),
        };
        write!(f, "{}/{}", self.kind.as_str(), delim)?;
        if let Some(q) = self.quote {
            write!(f, "/{}", q as char)?;
        }
        if self.compression.is_gzip() {
            write!(f, "+gzip")?;
        }
        Ok(())
    }
}

/// Line terminator observed in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineTerminator {
    Lf,
    CrLf,
}

impl LineTerminator {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineTerminator::Lf => "LF",
            LineTerminator::CrLf => "CRLF",
        }
    }
}

/// Identity of one input file as declared by configuration.
///
/// Immutable for the lifetime of a job. The effective [`Format`] is derived
/// by detection and carried alongside in [`ResolvedInput`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Absolute path of the input file.
    pub path: PathBuf,
    /// Target warehouse table.
    pub table: String,
    /// Declared date column name.
    pub date_column: String,
    /// Expected column list, in order. Empty means "take the first row's width".
    #[serde(default)]
    pub expected_columns: Vec<String>,
    /// Explicit delimiter override.
    #[serde(default)]
    pub delimiter: Option<char>,
    /// Explicit quote override.
    #[serde(default)]
    pub quote: Option<char>,
    /// Explicit compression override.
    #[serde(default)]
    pub compression: Option<Compression>,
    /// Header rows to skip (0 = headerless, the default).
    #[serde(default)]
    pub skip_header: u32,
}

impl FileDescriptor {
    /// Index of the declared date column within the expected column list.
    pub fn date_column_index(&self) -> Option<usize> {
        self.expected_columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(&self.date_column))
    }
}

/// A descriptor joined with its detected format. Constructing this is the
/// single point where a file's effective format is fixed.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub descriptor: FileDescriptor,
    pub format: Format,
    /// Detection confidence in [0, 1]; 1.0 for explicit overrides.
    pub confidence: f64,
}

// ============================================================================
// Reports
// ============================================================================

/// Output of the streaming sizing pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// On-disk size of the input.
    pub file_bytes: u64,
    /// Data rows (header rows excluded).
    pub row_count: u64,
    /// Field count of the first non-empty row.
    pub column_count: usize,
    pub terminator: LineTerminator,
    /// Set when the file ended mid-line; the partial row is not counted.
    pub truncated: bool,
    pub format: Format,
    pub confidence: f64,
}

/// One row whose field count differed from the expected column count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowAnomaly {
    /// Zero-based data row index.
    pub row: u64,
    pub observed: usize,
}

/// A composite key that occurred more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// Key tuple, unit-separated.
    pub key: String,
    pub count: u64,
    /// Row indices where the key recurred, capped by retention policy.
    pub sample_rows: Vec<u64>,
}

/// A date whose row count falls outside the 0.5x..2x median band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateAnomaly {
    pub date: NaiveDate,
    pub count: u64,
    /// Count relative to the median across all dates in the file/window.
    pub ratio: f64,
}

/// Output of the streaming quality pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub total_rows: u64,
    /// Per-date row counts; iteration order is the ordered distinct-date set.
    pub rows_per_date: BTreeMap<NaiveDate, u64>,
    /// Exact count of rows with a bad field count (samples are capped).
    pub row_anomaly_count: u64,
    pub row_anomalies: Vec<RowAnomaly>,
    /// Exact count of rows whose date failed to parse (samples are capped).
    pub invalid_date_count: u64,
    pub invalid_date_samples: Vec<u64>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub date_anomalies: Vec<DateAnomaly>,
    pub delimiter_confidence: f64,
}

impl QualityReport {
    pub fn distinct_dates(&self) -> Vec<NaiveDate> {
        self.rows_per_date.keys().copied().collect()
    }

    /// True when no row-level findings of any kind were recorded.
    pub fn is_clean(&self) -> bool {
        self.row_anomaly_count == 0
            && self.invalid_date_count == 0
            && self.duplicate_groups.is_empty()
            && self.date_anomalies.is_empty()
    }
}

/// A maximal run of expected dates absent from the table, reported with its
/// flanking boundaries (the day before the run and the day after it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Number of missing dates inside the run.
    pub length: u32,
}

/// Output of post-load completeness validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub expected_dates: u32,
    pub present_dates: Vec<NaiveDate>,
    pub missing_dates: Vec<NaiveDate>,
    pub gaps: Vec<GapRange>,
    pub anomalous_dates: Vec<DateAnomaly>,
    /// Only populated when key columns were supplied.
    pub duplicate_rows: Option<u64>,
    pub total_rows: u64,
}

impl CompletenessReport {
    pub fn is_complete(&self) -> bool {
        self.missing_dates.is_empty()
    }
}

// ============================================================================
// Warehouse handles
// ============================================================================

/// Server-side query identifier for an asynchronously submitted statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-file ephemeral staging location under the user stage.
///
/// Every handle created must be destroyed on exit or surfaced in the job's
/// recovery list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHandle {
    pub table: String,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub uploaded_parts: u32,
}

impl StageHandle {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            uploaded_parts: 0,
        }
    }

    /// Stage path of the form `@~/<table>/<uuid>/`.
    pub fn path(&self) -> String {
        format!("@~/{}/{}/", self.table, self.id)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Validation behaviour requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    Skip,
    FileOnly,
    WarehouseOnly,
    #[default]
    Both,
}

impl ValidationPolicy {
    pub fn validates_file(&self) -> bool {
        matches!(self, ValidationPolicy::FileOnly | ValidationPolicy::Both)
    }

    pub fn validates_warehouse(&self) -> bool {
        matches!(self, ValidationPolicy::WarehouseOnly | ValidationPolicy::Both)
    }
}

/// Whether a validation finding warns or fails the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Warn,
    Fail,
}

/// Failure classification, mirroring the operator-facing taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    ConfigInvalid,
    FileIo,
    FormatUndetermined,
    QualityFailed,
    ConnectionLost,
    LoadFailed,
    Timeout,
    Cancelled,
    WarehouseValidationFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConfigInvalid => "CONFIG_INVALID",
            FailureKind::FileIo => "FILE_IO",
            FailureKind::FormatUndetermined => "FORMAT_UNDETERMINED",
            FailureKind::QualityFailed => "QUALITY_FAILED",
            FailureKind::ConnectionLost => "CONNECTION_LOST",
            FailureKind::LoadFailed => "LOAD_FAILED",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::Cancelled => "CANCELLED",
            FailureKind::WarehouseValidationFailed => "WAREHOUSE_VALIDATION_FAILED",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured failure payload attached to a failed outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    /// One-line human summary.
    pub summary: String,
    /// Server query id, when the failure happened past submission.
    pub query_id: Option<QueryId>,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, summary: impl Into<String>) -> Self {
        Self {
            kind,
            summary: summary.into(),
            query_id: None,
        }
    }

    pub fn with_query_id(mut self, id: QueryId) -> Self {
        self.query_id = Some(id);
        self
    }
}

/// The report that caused a validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValidationFailure {
    Quality(Box<QualityReport>),
    Completeness(Box<CompletenessReport>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    Empty,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Empty => "EMPTY",
        }
    }
}

/// Terminal result for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileOutcome {
    Loaded {
        rows: u64,
    },
    ValidationFailed {
        detail: FailureDetail,
        failure: ValidationFailure,
    },
    LoadFailed(FailureDetail),
    Skipped {
        reason: SkipReason,
    },
}

impl FileOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            FileOutcome::ValidationFailed { .. } | FileOutcome::LoadFailed(_)
        )
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            FileOutcome::ValidationFailed { detail, .. } => Some(detail.kind),
            FileOutcome::LoadFailed(detail) => Some(detail.kind),
            _ => None,
        }
    }

    /// One-line rendering for logs and the job report.
    pub fn summary(&self) -> String {
        match self {
            FileOutcome::Loaded { rows } => format!("LOADED({rows})"),
            FileOutcome::ValidationFailed { detail, .. } => {
                format!("{}: {}", detail.kind, detail.summary)
            }
            FileOutcome::LoadFailed(detail) => format!("{}: {}", detail.kind, detail.summary),
            FileOutcome::Skipped { reason } => format!("SKIPPED({})", reason.as_str()),
        }
    }
}

/// A non-fatal finding attached to the job report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWarning {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub summary: String,
}

/// Aggregated result of one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobReport {
    pub outcomes: Vec<(PathBuf, FileOutcome)>,
    pub warnings: Vec<JobWarning>,
    /// Stage handles that could not be cleaned up and need operator action.
    pub recovery: Vec<StageHandle>,
}

impl JobReport {
    pub fn loaded_files(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, FileOutcome::Loaded { .. }))
            .count()
    }

    pub fn failed_files(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failure()).count()
    }

    pub fn total_rows_loaded(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                FileOutcome::Loaded { rows } => *rows,
                _ => 0,
            })
            .sum()
    }

    pub fn any_failed(&self) -> bool {
        self.failed_files() > 0
    }
}

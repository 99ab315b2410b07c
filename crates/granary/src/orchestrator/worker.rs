//! Per-file pipeline: the phase machine one worker runs end-to-end.

use super::FileResult;
use chrono::NaiveDate;
use granary_protocol::cancel::CancelToken;
use granary_protocol::config::JobConfig;
use granary_protocol::defaults::CONFIDENCE_WARN_THRESHOLD;
use granary_protocol::progress::{Phase, ProgressSink};
use granary_protocol::types::{
    FailureDetail, FailureKind, FileDescriptor, FileOutcome, JobWarning, QualityReport,
    ResolvedInput, Severity, SkipReason, StageHandle, ValidationFailure,
};
use granary_scan::format::FormatError;
use granary_scan::quality::QualityOptions;
use granary_warehouse::completeness::{CompletenessRequest, CompletenessValidator};
use granary_warehouse::loader::{LoadErrorKind, LoaderConfig, WarehouseLoader};
use granary_warehouse::pool::ConnectionPool;
use tracing::warn;

pub(crate) struct WorkerContext<'a> {
    pub config: &'a JobConfig,
    pub window: Option<(NaiveDate, NaiveDate)>,
    pub pool: &'a ConnectionPool,
    pub sink: &'a dyn ProgressSink,
    pub cancel: &'a CancelToken,
    pub completeness: &'a CompletenessValidator,
}

pub(crate) fn process_file(
    index: usize,
    fd: FileDescriptor,
    ctx: &WorkerContext<'_>,
) -> FileResult {
    let path = fd.path.clone();
    let mut warnings = Vec::new();
    let mut recovery = None;
    let outcome = run_pipeline(fd, ctx, &mut warnings, &mut recovery);
    ctx.sink.on_file_end(&path, &outcome);
    FileResult {
        index,
        path,
        outcome,
        warnings,
        recovery,
    }
}

fn run_pipeline(
    fd: FileDescriptor,
    ctx: &WorkerContext<'_>,
    warnings: &mut Vec<JobWarning>,
    recovery: &mut Option<StageHandle>,
) -> FileOutcome {
    let config = ctx.config;
    if ctx.cancel.is_cancelled() {
        return cancelled();
    }

    // Resolve the effective format; the single point it is ever set.
    let (format, confidence) = match granary_scan::detect_format(&fd, config.escape_style) {
        Ok(resolved) => resolved,
        Err(FormatError::Empty { .. }) => {
            return FileOutcome::Skipped {
                reason: SkipReason::Empty,
            }
        }
        Err(e @ FormatError::Undetermined { .. }) => {
            return failed(FailureKind::FormatUndetermined, e.to_string())
        }
        Err(e @ FormatError::Unreadable { .. }) => {
            return failed(FailureKind::FileIo, e.to_string())
        }
    };
    if confidence < CONFIDENCE_WARN_THRESHOLD && fd.delimiter.is_none() {
        return failed(
            FailureKind::FormatUndetermined,
            format!("format detection confidence {confidence:.2} below threshold"),
        );
    }
    let input = ResolvedInput {
        descriptor: fd,
        format,
        confidence,
    };

    let analysis = match granary_scan::analyze(&input, config.escape_style, ctx.sink) {
        Ok(report) => report,
        Err(e) => return failed(FailureKind::FileIo, e.to_string()),
    };
    if analysis.row_count == 0 {
        return FileOutcome::Skipped {
            reason: SkipReason::Empty,
        };
    }
    if ctx.cancel.is_cancelled() {
        return cancelled();
    }

    let mut quality = None;
    if config.validation_policy.validates_file() {
        let options = QualityOptions {
            duplicate_key: config.duplicate_key.clone(),
            escape_style: config.escape_style,
        };
        match granary_scan::validate_quality(&input, &options, ctx.sink) {
            Ok(report) => {
                if report.total_rows != analysis.row_count {
                    warn!(
                        file = %input.descriptor.path.display(),
                        analyzer = analysis.row_count,
                        validator = report.total_rows,
                        "row counts disagree between scans"
                    );
                }
                if let Some(outcome) =
                    evaluate_quality(&input, &report, config, warnings)
                {
                    return outcome;
                }
                quality = Some(report);
            }
            Err(e) => return failed(FailureKind::FileIo, e.to_string()),
        }
    }
    if ctx.cancel.is_cancelled() {
        return cancelled();
    }

    let loader = WarehouseLoader::new(ctx.pool, LoaderConfig::from_job(config));
    let receipt = match loader.load(&input, &analysis, ctx.cancel, ctx.sink) {
        Ok(receipt) => receipt,
        Err(e) => {
            *recovery = e.recovery.clone();
            let mut detail = FailureDetail::new(map_load_kind(e.kind), e.message.clone());
            detail.query_id = e.query_id.clone();
            return FileOutcome::LoadFailed(detail);
        }
    };
    if receipt.cleanup_failed {
        *recovery = Some(receipt.stage.clone());
    }

    if config.validation_policy.validates_warehouse() {
        ctx.sink
            .on_file_start(&input.descriptor.path, Phase::ValidatingWarehouse, None);
        if let Some(outcome) =
            validate_warehouse(&input.descriptor, quality.as_ref(), ctx, warnings)
        {
            return outcome;
        }
    }

    FileOutcome::Loaded {
        rows: receipt.rows_loaded,
    }
}

fn cancelled() -> FileOutcome {
    FileOutcome::LoadFailed(FailureDetail::new(FailureKind::Cancelled, "job cancelled"))
}

fn failed(kind: FailureKind, summary: impl Into<String>) -> FileOutcome {
    FileOutcome::LoadFailed(FailureDetail::new(kind, summary))
}

fn map_load_kind(kind: LoadErrorKind) -> FailureKind {
    match kind {
        LoadErrorKind::Io => FailureKind::FileIo,
        LoadErrorKind::ConnectionLost => FailureKind::ConnectionLost,
        LoadErrorKind::Server => FailureKind::LoadFailed,
        LoadErrorKind::Timeout => FailureKind::Timeout,
        LoadErrorKind::Cancelled => FailureKind::Cancelled,
    }
}

/// Apply per-check severity to the quality findings: `fail` findings end
/// the file, `warn` findings go on the job report.
fn evaluate_quality(
    input: &ResolvedInput,
    report: &QualityReport,
    config: &JobConfig,
    warnings: &mut Vec<JobWarning>,
) -> Option<FileOutcome> {
    let severity = &config.severity;
    let mut failures: Vec<String> = Vec::new();
    let mut notes: Vec<String> = Vec::new();

    let mut record = |finding: Option<String>, level: Severity| {
        if let Some(finding) = finding {
            match level {
                Severity::Fail => failures.push(finding),
                Severity::Warn => notes.push(finding),
            }
        }
    };

    record(
        (report.row_anomaly_count > 0).then(|| {
            format!(
                "{} rows with unexpected column count",
                report.row_anomaly_count
            )
        }),
        severity.row_anomalies,
    );
    record(
        (report.invalid_date_count > 0)
            .then(|| format!("{} rows with unparseable dates", report.invalid_date_count)),
        severity.invalid_dates,
    );
    record(
        (!report.duplicate_groups.is_empty())
            .then(|| format!("{} duplicate key groups", report.duplicate_groups.len())),
        severity.duplicates,
    );
    // statistical volume findings never hard-fail a file on their own
    record(
        (!report.date_anomalies.is_empty()).then(|| {
            format!(
                "{} dates with anomalous row counts",
                report.date_anomalies.len()
            )
        }),
        Severity::Warn,
    );

    for note in notes {
        warnings.push(JobWarning {
            path: input.descriptor.path.clone(),
            kind: FailureKind::QualityFailed,
            summary: note,
        });
    }

    if failures.is_empty() {
        return None;
    }
    Some(FileOutcome::ValidationFailed {
        detail: FailureDetail::new(FailureKind::QualityFailed, failures.join("; ")),
        failure: ValidationFailure::Quality(Box::new(report.clone())),
    })
}

/// Post-load completeness. Findings warn by default and fail under strict
/// severity; infrastructure trouble here never un-loads a loaded file.
fn validate_warehouse(
    fd: &FileDescriptor,
    quality: Option<&QualityReport>,
    ctx: &WorkerContext<'_>,
    warnings: &mut Vec<JobWarning>,
) -> Option<FileOutcome> {
    let window = ctx.window.or_else(|| {
        let dates = quality.map(QualityReport::distinct_dates).unwrap_or_default();
        match (dates.first(), dates.last()) {
            (Some(first), Some(last)) => Some((*first, *last)),
            _ => None,
        }
    });
    let Some((window_start, window_end)) = window else {
        warnings.push(JobWarning {
            path: fd.path.clone(),
            kind: FailureKind::WarehouseValidationFailed,
            summary: "no date window available; completeness validation skipped".into(),
        });
        return None;
    };

    let lease = match ctx.pool.acquire(ctx.config.acquire_timeout()) {
        Ok(lease) => lease,
        Err(e) => {
            warnings.push(JobWarning {
                path: fd.path.clone(),
                kind: FailureKind::WarehouseValidationFailed,
                summary: format!("completeness validation could not run: {e}"),
            });
            return None;
        }
    };

    let request = CompletenessRequest {
        table: &fd.table,
        date_column: &fd.date_column,
        window_start,
        window_end,
        key_columns: ctx.config.duplicate_key.as_deref(),
    };
    let report = match ctx.completeness.validate(lease.session().as_ref(), &request) {
        Ok(report) => report,
        Err(e) => {
            warnings.push(JobWarning {
                path: fd.path.clone(),
                kind: FailureKind::WarehouseValidationFailed,
                summary: format!("completeness validation could not run: {e}"),
            });
            return None;
        }
    };

    let mut findings: Vec<String> = Vec::new();
    if !report.missing_dates.is_empty() {
        findings.push(format!(
            "{} of {} expected dates missing",
            report.missing_dates.len(),
            report.expected_dates
        ));
    }
    if !report.anomalous_dates.is_empty() {
        findings.push(format!(
            "{} dates with anomalous row counts",
            report.anomalous_dates.len()
        ));
    }
    if let Some(dups) = report.duplicate_rows {
        if dups > 0 {
            findings.push(format!("{dups} duplicate rows in window"));
        }
    }
    if findings.is_empty() {
        return None;
    }

    let summary = findings.join("; ");
    if ctx.config.severity.completeness == Severity::Fail {
        return Some(FileOutcome::ValidationFailed {
            detail: FailureDetail::new(FailureKind::WarehouseValidationFailed, summary),
            failure: ValidationFailure::Completeness(Box::new(report)),
        });
    }
    warnings.push(JobWarning {
        path: fd.path.clone(),
        kind: FailureKind::WarehouseValidationFailed,
        summary,
    });
    None
}

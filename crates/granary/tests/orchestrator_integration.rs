//! End-to-end jobs against temp files and the scripted warehouse double.

use chrono::NaiveDate;
use granary::orchestrator::{Job, LoadOrchestrator};
use granary_protocol::config::{JobConfig, SeverityConfig};
use granary_protocol::progress::Phase;
use granary_protocol::types::{
    FailureKind, FileDescriptor, FileOutcome, Severity, SkipReason, ValidationPolicy,
};
use granary_test_utils::{write_delimited, CollectingSink, MockWarehouse};
use granary_warehouse::pool::ConnectionPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 9, day).unwrap()
}

fn descriptor(path: &Path) -> FileDescriptor {
    FileDescriptor {
        path: path.to_path_buf(),
        table: "sales".into(),
        date_column: "load_date".into(),
        expected_columns: vec!["id".into(), "load_date".into(), "amount".into()],
        delimiter: None,
        quote: None,
        compression: None,
        skip_header: 0,
    }
}

/// One TSV with `rows_per_day` rows for each given September 2022 day.
fn month_file(dir: &Path, name: &str, days: &[u32], rows_per_day: u64) -> (PathBuf, u64) {
    let path = dir.join(name);
    let mut owned: Vec<Vec<String>> = Vec::new();
    let mut id = 0u64;
    for &day in days {
        for _ in 0..rows_per_day {
            owned.push(vec![
                id.to_string(),
                format!("202209{day:02}"),
                "10.00".to_string(),
            ]);
            id += 1;
        }
    }
    let borrowed: Vec<Vec<&str>> = owned
        .iter()
        .map(|r| r.iter().map(String::as_str).collect())
        .collect();
    write_delimited(&path, '\t', &borrowed).unwrap();
    (path, id)
}

fn warehouse_with_schema() -> MockWarehouse {
    let warehouse = MockWarehouse::new();
    warehouse.set_schema(&[
        ("ID", "NUMBER(38,0)"),
        ("LOAD_DATE", "DATE"),
        ("AMOUNT", "NUMBER(18,2)"),
    ]);
    warehouse
}

fn build_orchestrator(warehouse: &MockWarehouse, capacity: usize) -> (LoadOrchestrator, CollectingSink) {
    let sink = CollectingSink::new();
    let pool = ConnectionPool::new(warehouse.connector(), capacity);
    (
        LoadOrchestrator::new(pool, Arc::new(sink.clone())),
        sink,
    )
}

#[test]
fn happy_path_month_load() {
    let dir = tempfile::tempdir().unwrap();
    let days: Vec<u32> = (1..=5).collect();
    let (path, total) = month_file(dir.path(), "sales_202209.tsv", &days, 12);

    let warehouse = warehouse_with_schema();
    warehouse.set_copy_rows(total);
    let table: Vec<(NaiveDate, u64)> = days.iter().map(|&day| (d(day), 12)).collect();
    warehouse.set_table_dates(&table);

    let (orchestrator, sink) = build_orchestrator(&warehouse, 4);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&path)],
            window: None,
            config: JobConfig::default(),
        })
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    match &report.outcomes[0].1 {
        FileOutcome::Loaded { rows } => assert_eq!(*rows, total),
        other => panic!("expected Loaded, got {}", other.summary()),
    }
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(report.recovery.is_empty());
    assert!(!report.any_failed());

    // the full phase machine ran, in order
    assert_eq!(
        sink.phases_for(&path),
        vec![
            Phase::Analyzing,
            Phase::ValidatingFile,
            Phase::Compressing,
            Phase::Uploading,
            Phase::Copying,
            Phase::ValidatingWarehouse,
        ]
    );
}

#[test]
fn gap_detected_after_load_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    // the file (and the table) are missing 2022-09-04
    let days = vec![1, 2, 3, 5];
    let (path, total) = month_file(dir.path(), "sales.tsv", &days, 10);

    let warehouse = warehouse_with_schema();
    warehouse.set_copy_rows(total);
    let table: Vec<(NaiveDate, u64)> = days.iter().map(|&day| (d(day), 10)).collect();
    warehouse.set_table_dates(&table);

    let (orchestrator, _sink) = build_orchestrator(&warehouse, 2);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&path)],
            window: Some((d(1), d(5))),
            config: JobConfig::default(),
        })
        .unwrap();

    // loaded, but the report carries the completeness finding
    assert!(matches!(report.outcomes[0].1, FileOutcome::Loaded { .. }));
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(
        report.warnings[0].kind,
        FailureKind::WarehouseValidationFailed
    );
    assert!(report.warnings[0].summary.contains("1 of 5"));
}

#[test]
fn strict_completeness_fails_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let days = vec![1, 2, 3, 5];
    let (path, total) = month_file(dir.path(), "sales.tsv", &days, 10);

    let warehouse = warehouse_with_schema();
    warehouse.set_copy_rows(total);
    let table: Vec<(NaiveDate, u64)> = days.iter().map(|&day| (d(day), 10)).collect();
    warehouse.set_table_dates(&table);

    let config = JobConfig {
        severity: SeverityConfig {
            completeness: Severity::Fail,
            ..SeverityConfig::default()
        },
        ..JobConfig::default()
    };

    let (orchestrator, _sink) = build_orchestrator(&warehouse, 2);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&path)],
            window: Some((d(1), d(5))),
            config,
        })
        .unwrap();

    assert_eq!(
        report.outcomes[0].1.kind(),
        Some(FailureKind::WarehouseValidationFailed)
    );
    assert!(report.any_failed());
}

#[test]
fn strict_quality_fails_before_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ragged.tsv");
    write_delimited(
        &path,
        '\t',
        &[
            vec!["1", "20220901", "10"],
            vec!["2", "20220901"], // short row
            vec!["3", "20220902", "12"],
        ],
    )
    .unwrap();

    let warehouse = warehouse_with_schema();
    let config = JobConfig {
        severity: SeverityConfig {
            row_anomalies: Severity::Fail,
            ..SeverityConfig::default()
        },
        ..JobConfig::default()
    };

    let (orchestrator, _sink) = build_orchestrator(&warehouse, 2);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&path)],
            window: None,
            config,
        })
        .unwrap();

    assert_eq!(
        report.outcomes[0].1.kind(),
        Some(FailureKind::QualityFailed)
    );
    // the load never started
    assert!(!warehouse.executed().iter().any(|s| s.starts_with("COPY")));
    assert!(warehouse.uploaded_parts().is_empty());
}

#[test]
fn zero_byte_file_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.tsv");
    std::fs::write(&path, b"").unwrap();

    let warehouse = warehouse_with_schema();
    let (orchestrator, _sink) = build_orchestrator(&warehouse, 2);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&path)],
            window: None,
            config: JobConfig::default(),
        })
        .unwrap();

    assert!(matches!(
        report.outcomes[0].1,
        FileOutcome::Skipped {
            reason: SkipReason::Empty
        }
    ));
    assert!(!report.any_failed());
    assert!(warehouse.executed().is_empty());
}

#[test]
fn one_failure_does_not_stop_the_job_by_default() {
    let dir = tempfile::tempdir().unwrap();
    // first file's row count will disagree with the scripted COPY result
    let (bad, _) = month_file(dir.path(), "bad.tsv", &[1], 5);
    let (good, good_total) = month_file(dir.path(), "good.tsv", &[1], 7);

    let warehouse = warehouse_with_schema();
    warehouse.set_copy_rows(good_total); // 7: wrong for bad.tsv, right for good.tsv
    warehouse.set_table_dates(&[(d(1), 7)]);

    let config = JobConfig {
        workers: 1, // deterministic processing order
        validation_policy: ValidationPolicy::FileOnly,
        ..JobConfig::default()
    };

    let (orchestrator, _sink) = build_orchestrator(&warehouse, 2);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&bad), descriptor(&good)],
            window: None,
            config,
        })
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].1.kind(), Some(FailureKind::LoadFailed));
    assert!(matches!(report.outcomes[1].1, FileOutcome::Loaded { rows } if rows == good_total));
    assert!(report.any_failed());
}

#[test]
fn fail_fast_cancels_remaining_files() {
    let dir = tempfile::tempdir().unwrap();
    let (bad, _) = month_file(dir.path(), "bad.tsv", &[1], 5);
    let (rest, _) = month_file(dir.path(), "rest.tsv", &[1], 7);

    let warehouse = warehouse_with_schema();
    warehouse.set_copy_rows(9999); // every COPY disagrees with its analyzer count

    let config = JobConfig {
        workers: 1,
        continue_on_error: false,
        validation_policy: ValidationPolicy::Skip,
        ..JobConfig::default()
    };

    let (orchestrator, _sink) = build_orchestrator(&warehouse, 2);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&bad), descriptor(&rest)],
            window: None,
            config,
        })
        .unwrap();

    assert_eq!(report.outcomes[0].1.kind(), Some(FailureKind::LoadFailed));
    assert_eq!(report.outcomes[1].1.kind(), Some(FailureKind::Cancelled));
}

#[test]
fn four_files_load_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    for i in 0..4 {
        let (path, _) = month_file(dir.path(), &format!("part{i}.tsv"), &[1, 2], 5);
        files.push(descriptor(&path));
    }

    let warehouse = warehouse_with_schema();
    warehouse.set_copy_rows(10);
    warehouse.set_table_dates(&[(d(1), 5), (d(2), 5)]);

    let config = JobConfig {
        workers: 4,
        pool_capacity: 4,
        ..JobConfig::default()
    };

    let (orchestrator, _sink) = build_orchestrator(&warehouse, 4);
    let report = orchestrator
        .run(Job {
            files,
            window: Some((d(1), d(2))),
            config,
        })
        .unwrap();

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.loaded_files(), 4);
    assert_eq!(report.total_rows_loaded(), 40);
    // the pool never needed more sessions than its capacity
    assert!(warehouse.connections() <= 4);
}

#[test]
fn skip_policy_runs_no_validation() {
    let dir = tempfile::tempdir().unwrap();
    // invalid dates everywhere; SKIP must not care
    let path = dir.path().join("junk_dates.tsv");
    write_delimited(
        &path,
        '\t',
        &[vec!["1", "garbage", "10"], vec!["2", "junk", "11"]],
    )
    .unwrap();

    let warehouse = warehouse_with_schema();
    warehouse.set_copy_rows(2);

    let config = JobConfig {
        validation_policy: ValidationPolicy::Skip,
        ..JobConfig::default()
    };

    let (orchestrator, sink) = build_orchestrator(&warehouse, 2);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&path)],
            window: None,
            config,
        })
        .unwrap();

    assert!(matches!(report.outcomes[0].1, FileOutcome::Loaded { rows: 2 }));
    let phases = sink.phases_for(&path);
    assert!(!phases.contains(&Phase::ValidatingFile));
    assert!(!phases.contains(&Phase::ValidatingWarehouse));
}

#[test]
fn bad_descriptor_is_config_invalid_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = month_file(dir.path(), "sales.tsv", &[1], 3);

    let mut fd = descriptor(&path);
    fd.date_column = "not_in_columns".into();

    let warehouse = warehouse_with_schema();
    let (orchestrator, _sink) = build_orchestrator(&warehouse, 2);
    let result = orchestrator.run(Job {
        files: vec![fd],
        window: None,
        config: JobConfig::default(),
    });

    assert!(result.is_err());
    assert!(warehouse.executed().is_empty());
}

#[test]
fn file_dates_are_a_subset_of_present_dates_after_load() {
    let dir = tempfile::tempdir().unwrap();
    let days = vec![1, 2, 3];
    let (path, total) = month_file(dir.path(), "sales.tsv", &days, 4);

    let warehouse = warehouse_with_schema();
    warehouse.set_copy_rows(total);
    // warehouse holds a superset: an older date besides the file's three
    let mut table: Vec<(NaiveDate, u64)> = days.iter().map(|&day| (d(day), 4)).collect();
    table.push((d(6), 4));
    warehouse.set_table_dates(&table);

    let (orchestrator, _sink) = build_orchestrator(&warehouse, 2);
    let report = orchestrator
        .run(Job {
            files: vec![descriptor(&path)],
            window: Some((d(1), d(6))),
            config: JobConfig::default(),
        })
        .unwrap();

    // dates 4 and 5 are genuinely absent; the file's own dates are present
    assert!(matches!(report.outcomes[0].1, FileOutcome::Loaded { .. }));
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].summary.contains("2 of 6"));
}

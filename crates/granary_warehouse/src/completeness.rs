//! Post-load completeness validation.
//!
//! A handful of aggregate queries confirms a loaded date window regardless
//! of table size: total rows, distinct dates, per-date counts, and an
//! optional duplicate count. The date column's declared type is probed once
//! per table and cached for the job, and drives how date literals are bound.

use crate::ident::{validate_identifier, IdentError};
use crate::session::{Session, SessionError, SqlValue};
use chrono::NaiveDate;
use granary_protocol::dates;
use granary_protocol::stats::date_count_anomalies;
use granary_protocol::types::{CompletenessReport, GapRange};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CompletenessError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Ident(#[from] IdentError),
    #[error("table {0} not found in the schema catalog")]
    UnknownTable(String),
    #[error("column {column} not found on table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("column {column} has unsupported date type {data_type}")]
    UnsupportedDateType { column: String, data_type: String },
    #[error("window start {0} is after window end {1}")]
    EmptyWindow(NaiveDate, NaiveDate),
    #[error("malformed result: {0}")]
    Malformed(String),
}

/// How the table stores its date column; decides bind literal shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateColumnType {
    Text,
    YyyymmddInt,
    NativeDate,
}

impl DateColumnType {
    fn from_declared(data_type: &str) -> Option<Self> {
        let t = data_type.to_ascii_uppercase();
        if t.contains("CHAR") || t.contains("TEXT") || t.contains("STRING") {
            Some(DateColumnType::Text)
        } else if t.contains("INT") || t.contains("NUMBER") || t.contains("NUMERIC") || t.contains("DECIMAL") {
            Some(DateColumnType::YyyymmddInt)
        } else if t.contains("DATE") || t.contains("TIMESTAMP") {
            Some(DateColumnType::NativeDate)
        } else {
            None
        }
    }

    fn bind(&self, date: NaiveDate) -> SqlValue {
        match self {
            DateColumnType::Text => SqlValue::Str(dates::canonical(date)),
            DateColumnType::YyyymmddInt => SqlValue::Int(dates::yyyymmdd_int(date)),
            DateColumnType::NativeDate => SqlValue::Date(date),
        }
    }
}

/// One table's probed shape: its column list and the date column's type.
#[derive(Debug, Clone)]
struct TableProbe {
    columns: Vec<String>,
    date_type: DateColumnType,
}

/// Parameters for one validation run.
#[derive(Debug, Clone)]
pub struct CompletenessRequest<'a> {
    pub table: &'a str,
    pub date_column: &'a str,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Composite key for the optional duplicate count.
    pub key_columns: Option<&'a [String]>,
}

/// Aggregate-query validator with a per-job schema probe cache.
#[derive(Default)]
pub struct CompletenessValidator {
    probes: Mutex<HashMap<String, TableProbe>>,
}

impl CompletenessValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(
        &self,
        session: &dyn Session,
        request: &CompletenessRequest<'_>,
    ) -> Result<CompletenessReport, CompletenessError> {
        if request.window_start > request.window_end {
            return Err(CompletenessError::EmptyWindow(
                request.window_start,
                request.window_end,
            ));
        }
        let table = validate_identifier(request.table)?;
        let date_column = validate_identifier(request.date_column)?;

        let probe = self.probe(session, table, date_column)?;
        require_column(&probe, table, date_column)?;
        if let Some(keys) = request.key_columns {
            for key in keys {
                validate_identifier(key)?;
                require_column(&probe, table, key)?;
            }
        }

        let start = probe.date_type.bind(request.window_start);
        let end = probe.date_type.bind(request.window_end);
        let binds = [start, end];

        let total_rows = self.count_rows(session, table, date_column, &binds)?;
        let present_dates = self.distinct_dates(session, table, date_column, &binds, probe.date_type)?;
        let rows_per_date =
            self.per_date_counts(session, table, date_column, &binds, probe.date_type)?;
        let duplicate_rows = match request.key_columns {
            Some(keys) => Some(self.duplicate_count(session, table, date_column, keys, &binds)?),
            None => None,
        };

        let expected: Vec<NaiveDate> = window_dates(request.window_start, request.window_end);
        let missing_dates: Vec<NaiveDate> = expected
            .iter()
            .filter(|d| !present_dates.contains(d))
            .copied()
            .collect();
        let gaps = gap_ranges(&missing_dates);
        let anomalous_dates = date_count_anomalies(&rows_per_date);

        Ok(CompletenessReport {
            window_start: request.window_start,
            window_end: request.window_end,
            expected_dates: expected.len() as u32,
            present_dates,
            missing_dates,
            gaps,
            anomalous_dates,
            duplicate_rows,
            total_rows,
        })
    }

    /// Resolve the table's column list and date column type, once per job.
    fn probe(
        &self,
        session: &dyn Session,
        table: &str,
        date_column: &str,
    ) -> Result<TableProbe, CompletenessError> {
        let cache_key = table.to_ascii_uppercase();
        {
            let probes = self.probes.lock().expect("probe cache lock poisoned");
            if let Some(probe) = probes.get(&cache_key) {
                debug!(table, "schema probe cache hit");
                return Ok(probe.clone());
            }
        }

        let rows = session.query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = ?",
            &[SqlValue::Str(cache_key.clone())],
        )?;
        if rows.is_empty() {
            return Err(CompletenessError::UnknownTable(table.to_string()));
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut date_type = None;
        for row in &rows {
            let name = row
                .first()
                .and_then(SqlValue::as_str)
                .ok_or_else(|| CompletenessError::Malformed("schema probe row".into()))?;
            let declared = row
                .get(1)
                .and_then(SqlValue::as_str)
                .ok_or_else(|| CompletenessError::Malformed("schema probe row".into()))?;
            if name.eq_ignore_ascii_case(date_column) {
                date_type = Some(DateColumnType::from_declared(declared).ok_or_else(|| {
                    CompletenessError::UnsupportedDateType {
                        column: date_column.to_string(),
                        data_type: declared.to_string(),
                    }
                })?);
            }
            columns.push(name.to_string());
        }
        let date_type = date_type.ok_or_else(|| CompletenessError::UnknownColumn {
            table: table.to_string(),
            column: date_column.to_string(),
        })?;

        let probe = TableProbe { columns, date_type };
        self.probes
            .lock()
            .expect("probe cache lock poisoned")
            .insert(cache_key, probe.clone());
        Ok(probe)
    }

    fn count_rows(
        &self,
        session: &dyn Session,
        table: &str,
        date_column: &str,
        binds: &[SqlValue],
    ) -> Result<u64, CompletenessError> {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE {date_column} BETWEEN ? AND ?");
        let rows = session.query(&sql, binds)?;
        scalar_u64(&rows)
    }

    fn distinct_dates(
        &self,
        session: &dyn Session,
        table: &str,
        date_column: &str,
        binds: &[SqlValue],
        date_type: DateColumnType,
    ) -> Result<Vec<NaiveDate>, CompletenessError> {
        let sql = format!(
            "SELECT DISTINCT {date_column} FROM {table} \
             WHERE {date_column} BETWEEN ? AND ? ORDER BY {date_column}"
        );
        let rows = session.query(&sql, binds)?;
        rows.iter()
            .map(|row| cell_date(row.first(), date_type))
            .collect()
    }

    fn per_date_counts(
        &self,
        session: &dyn Session,
        table: &str,
        date_column: &str,
        binds: &[SqlValue],
        date_type: DateColumnType,
    ) -> Result<BTreeMap<NaiveDate, u64>, CompletenessError> {
        let sql = format!(
            "SELECT {date_column}, COUNT(*) FROM {table} \
             WHERE {date_column} BETWEEN ? AND ? GROUP BY {date_column}"
        );
        let rows = session.query(&sql, binds)?;
        let mut out = BTreeMap::new();
        for row in &rows {
            let date = cell_date(row.first(), date_type)?;
            let count = row
                .get(1)
                .and_then(SqlValue::as_i64)
                .ok_or_else(|| CompletenessError::Malformed("per-date count".into()))?;
            out.insert(date, count.max(0) as u64);
        }
        Ok(out)
    }

    fn duplicate_count(
        &self,
        session: &dyn Session,
        table: &str,
        date_column: &str,
        keys: &[String],
        binds: &[SqlValue],
    ) -> Result<u64, CompletenessError> {
        let key_list = keys.join(", ");
        let sql = format!(
            "SELECT COUNT(*) - COUNT(DISTINCT ({key_list})) FROM {table} \
             WHERE {date_column} BETWEEN ? AND ?"
        );
        let rows = session.query(&sql, binds)?;
        scalar_u64(&rows)
    }
}

fn require_column(
    probe: &TableProbe,
    table: &str,
    column: &str,
) -> Result<(), CompletenessError> {
    if probe.columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
        Ok(())
    } else {
        Err(CompletenessError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        })
    }
}

fn scalar_u64(rows: &[crate::session::Row]) -> Result<u64, CompletenessError> {
    rows.first()
        .and_then(|r| r.first())
        .and_then(SqlValue::as_i64)
        .map(|v| v.max(0) as u64)
        .ok_or_else(|| CompletenessError::Malformed("expected a single scalar".into()))
}

fn cell_date(
    cell: Option<&SqlValue>,
    date_type: DateColumnType,
) -> Result<NaiveDate, CompletenessError> {
    let parsed = match cell {
        Some(SqlValue::Date(d)) => Some(*d),
        Some(SqlValue::Str(s)) => dates::parse_load_date(s),
        Some(SqlValue::Int(i)) => dates::parse_load_date(&i.to_string()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        CompletenessError::Malformed(format!(
            "unparseable date cell {cell:?} for column type {date_type:?}"
        ))
    })
}

fn window_dates(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut day = start;
    while day <= end {
        out.push(day);
        day = day.succ_opt().expect("date overflow");
    }
    out
}

/// Missing dates collapse into flanked runs: `start`/`end` are the days
/// adjacent to the run, `length` the run itself.
fn gap_ranges(missing: &[NaiveDate]) -> Vec<GapRange> {
    let mut gaps = Vec::new();
    let mut i = 0;
    while i < missing.len() {
        let run_start = missing[i];
        let mut run_end = run_start;
        while i + 1 < missing.len()
            && missing[i + 1] == missing[i].succ_opt().expect("date overflow")
        {
            i += 1;
            run_end = missing[i];
        }
        gaps.push(GapRange {
            start: run_start.pred_opt().expect("date underflow"),
            end: run_end.succ_opt().expect("date overflow"),
            length: (run_end - run_start).num_days() as u32 + 1,
        });
        i += 1;
    }
    gaps
}

//! Streaming data-quality pass.
//!
//! One pass, memory bounded by distinct dates plus distinct duplicate keys
//! retained. Row-level findings are data, not errors: the scan never aborts
//! on a bad row, only on I/O failure.

use crate::fields::split_fields;
use crate::reader::RecordReader;
use crate::ScanError;
use granary_protocol::dates::parse_load_date_bytes;
use granary_protocol::defaults::{DUPLICATE_SAMPLE_CAP, PROGRESS_CHUNK_BYTES, ROW_SAMPLE_CAP};
use granary_protocol::progress::{Phase, ProgressSink};
use granary_protocol::stats::date_count_anomalies;
use granary_protocol::types::{
    DuplicateGroup, EscapeStyle, QualityReport, ResolvedInput, RowAnomaly,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;

/// Knobs the quality pass takes from job configuration.
#[derive(Debug, Clone, Default)]
pub struct QualityOptions {
    /// Composite key columns for duplicate detection; absent = skip.
    pub duplicate_key: Option<Vec<String>>,
    pub escape_style: EscapeStyle,
}

const KEY_SEPARATOR: u8 = 0x1f;

struct DupTracker {
    indices: Vec<usize>,
    counts: HashMap<u64, u64>,
    groups: HashMap<u64, DuplicateGroup>,
}

impl DupTracker {
    fn observe(&mut self, line: &[u8], ranges: &[std::ops::Range<usize>], row: u64) {
        let mut hasher = DefaultHasher::new();
        for &idx in &self.indices {
            match ranges.get(idx) {
                Some(r) => hasher.write(&line[r.clone()]),
                None => hasher.write(&[]),
            }
            hasher.write_u8(KEY_SEPARATOR);
        }
        let hash = hasher.finish();

        let count = self.counts.entry(hash).or_insert(0);
        *count += 1;
        if *count == 2 {
            let mut key = Vec::new();
            for (i, &idx) in self.indices.iter().enumerate() {
                if i > 0 {
                    key.push(KEY_SEPARATOR);
                }
                if let Some(r) = ranges.get(idx) {
                    key.extend_from_slice(&line[r.clone()]);
                }
            }
            self.groups.insert(
                hash,
                DuplicateGroup {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    count: 2,
                    sample_rows: vec![row],
                },
            );
        } else if *count > 2 {
            if let Some(group) = self.groups.get_mut(&hash) {
                group.count = *count;
                if group.sample_rows.len() < DUPLICATE_SAMPLE_CAP {
                    group.sample_rows.push(row);
                }
            }
        }
    }

    fn into_groups(self) -> Vec<DuplicateGroup> {
        let mut groups: Vec<DuplicateGroup> = self.groups.into_values().collect();
        groups.sort_by_key(|g| g.sample_rows.first().copied().unwrap_or(u64::MAX));
        groups
    }
}

/// Run the quality pass over one resolved input.
pub fn validate_quality(
    input: &ResolvedInput,
    options: &QualityOptions,
    sink: &dyn ProgressSink,
) -> Result<QualityReport, ScanError> {
    let fd = &input.descriptor;
    let path = fd.path.as_path();
    let format = &input.format;

    let file_bytes = std::fs::metadata(path)
        .map_err(|e| ScanError::io(path, e))?
        .len();
    sink.on_file_start(path, Phase::ValidatingFile, Some(file_bytes));

    let date_index = fd.date_column_index();
    let mut dup = options.duplicate_key.as_ref().map(|keys| DupTracker {
        indices: keys
            .iter()
            .filter_map(|k| {
                fd.expected_columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(k))
            })
            .collect(),
        counts: HashMap::new(),
        groups: HashMap::new(),
    });

    let mut reader =
        RecordReader::open(path, format.compression).map_err(|e| ScanError::io(path, e))?;

    let mut buf = Vec::new();
    let mut ranges = Vec::new();
    let mut expected_count = fd.expected_columns.len();

    let mut total_rows = 0u64;
    let mut rows_per_date: BTreeMap<chrono::NaiveDate, u64> = BTreeMap::new();
    let mut row_anomaly_count = 0u64;
    let mut row_anomalies: Vec<RowAnomaly> = Vec::new();
    let mut invalid_date_count = 0u64;
    let mut invalid_date_samples: Vec<u64> = Vec::new();

    let mut records_seen = 0u64;
    let mut reported = 0u64;

    loop {
        let more = reader.next_record(&mut buf).map_err(|e| ScanError::io(path, e))?;
        if !more {
            break;
        }
        records_seen += 1;
        if records_seen <= u64::from(fd.skip_header) {
            continue;
        }
        if buf.is_empty() {
            continue;
        }

        let row = total_rows;
        total_rows += 1;

        split_fields(
            &buf,
            format.delimiter,
            format.quote,
            options.escape_style,
            &mut ranges,
        );
        if expected_count == 0 {
            expected_count = ranges.len();
        }

        if ranges.len() != expected_count {
            row_anomaly_count += 1;
            if row_anomalies.len() < ROW_SAMPLE_CAP {
                row_anomalies.push(RowAnomaly {
                    row,
                    observed: ranges.len(),
                });
            }
            // a ragged row has no trustworthy date or key position
            continue;
        }

        match date_index.and_then(|i| ranges.get(i)) {
            Some(r) => match parse_load_date_bytes(&buf[r.clone()]) {
                Some(date) => {
                    *rows_per_date.entry(date).or_insert(0) += 1;
                }
                None => {
                    invalid_date_count += 1;
                    if invalid_date_samples.len() < ROW_SAMPLE_CAP {
                        invalid_date_samples.push(row);
                    }
                }
            },
            None => {
                invalid_date_count += 1;
                if invalid_date_samples.len() < ROW_SAMPLE_CAP {
                    invalid_date_samples.push(row);
                }
            }
        }

        if let Some(tracker) = dup.as_mut() {
            tracker.observe(&buf, &ranges, row);
        }

        let read = reader.bytes_read();
        if read - reported >= PROGRESS_CHUNK_BYTES {
            sink.on_progress(path, Phase::ValidatingFile, read - reported);
            reported = read;
        }
    }
    let read = reader.bytes_read();
    if read > reported {
        sink.on_progress(path, Phase::ValidatingFile, read - reported);
    }

    let date_anomalies = date_count_anomalies(&rows_per_date);

    Ok(QualityReport {
        total_rows,
        rows_per_date,
        row_anomaly_count,
        row_anomalies,
        invalid_date_count,
        invalid_date_samples,
        duplicate_groups: dup.map(DupTracker::into_groups).unwrap_or_default(),
        date_anomalies,
        delimiter_confidence: input.confidence,
    })
}

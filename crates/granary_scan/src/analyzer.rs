//! Streaming sizing pass: rows, bytes, column count, line terminator.

use crate::fields::split_fields;
use crate::reader::RecordReader;
use crate::ScanError;
use granary_protocol::defaults::{CONFIDENCE_WARN_THRESHOLD, PROGRESS_CHUNK_BYTES};
use granary_protocol::progress::{Phase, ProgressSink};
use granary_protocol::types::{AnalysisReport, EscapeStyle, ResolvedInput};

/// Single pass over the file; constant memory regardless of size.
///
/// Rows are terminated lines, minus `skip_header` leading records and empty
/// lines. A truncated final line is excluded and flagged. `escape` must be
/// the same style the quality pass runs with, so both scans split the first
/// row identically.
pub fn analyze(
    input: &ResolvedInput,
    escape: EscapeStyle,
    sink: &dyn ProgressSink,
) -> Result<AnalysisReport, ScanError> {
    let fd = &input.descriptor;
    let path = fd.path.as_path();

    if input.confidence < CONFIDENCE_WARN_THRESHOLD {
        tracing::warn!(
            file = %path.display(),
            confidence = input.confidence,
            "low format-detection confidence"
        );
    }

    let file_bytes = std::fs::metadata(path)
        .map_err(|e| ScanError::io(path, e))?
        .len();
    sink.on_file_start(path, Phase::Analyzing, Some(file_bytes));

    let mut reader =
        RecordReader::open(path, input.format.compression).map_err(|e| ScanError::io(path, e))?;

    let mut buf = Vec::new();
    let mut ranges = Vec::new();
    let mut rows = 0u64;
    let mut records_seen = 0u64;
    let mut column_count = 0usize;
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
        if column_count == 0 {
            split_fields(
                &buf,
                input.format.delimiter,
                input.format.quote,
                escape,
                &mut ranges,
            );
            column_count = ranges.len();
        }
        rows += 1;

        let read = reader.bytes_read();
        if read - reported >= PROGRESS_CHUNK_BYTES {
            sink.on_progress(path, Phase::Analyzing, read - reported);
            reported = read;
        }
    }
    let read = reader.bytes_read();
    if read > reported {
        sink.on_progress(path, Phase::Analyzing, read - reported);
    }

    if reader.truncated() {
        tracing::warn!(
            file = %path.display(),
            rows,
            "file ends mid-line; partial row not counted"
        );
    }

    Ok(AnalysisReport {
        file_bytes,
        row_count: rows,
        column_count,
        terminator: reader.terminator(),
        truncated: reader.truncated(),
        format: input.format,
        confidence: input.confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_protocol::progress::NullSink;
    use granary_protocol::types::{Compression, FileDescriptor, Format, LineTerminator};
    use std::io::Write;
    use std::path::Path;
    use tempfile::NamedTempFile;

    fn input(
        path: &Path,
        delimiter: u8,
        compression: Compression,
        skip_header: u32,
    ) -> ResolvedInput {
        ResolvedInput {
            descriptor: FileDescriptor {
                path: path.to_path_buf(),
                table: "t".into(),
                date_column: "d".into(),
                expected_columns: vec![],
                delimiter: None,
                quote: None,
                compression: None,
                skip_header,
            },
            format: Format::for_delimiter(delimiter, compression),
            confidence: 1.0,
        }
    }

    #[test]
    fn counts_rows_bytes_columns() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "1\ta\t9\n2\tb\t8\n3\tc\t7\n").unwrap();
        file.flush().unwrap();

        let report = analyze(
            &input(file.path(), b'\t', Compression::None, 0),
            EscapeStyle::Doubling,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.row_count, 3);
        assert_eq!(report.column_count, 3);
        assert_eq!(report.file_bytes, 18);
        assert_eq!(report.terminator, LineTerminator::Lf);
        assert!(!report.truncated);
    }

    #[test]
    fn skips_declared_header() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "id,name\n1,a\n2,b\n").unwrap();
        file.flush().unwrap();

        let report = analyze(
            &input(file.path(), b',', Compression::None, 1),
            EscapeStyle::Doubling,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.row_count, 2);
        assert_eq!(report.column_count, 2);
    }

    #[test]
    fn empty_lines_are_not_rows() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "1,a\n\n2,b\n").unwrap();
        file.flush().unwrap();

        let report = analyze(
            &input(file.path(), b',', Compression::None, 0),
            EscapeStyle::Doubling,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.row_count, 2);
    }

    #[test]
    fn truncated_file_rounds_down() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "1,a\n2,b\n3,c").unwrap();
        file.flush().unwrap();

        let report = analyze(
            &input(file.path(), b',', Compression::None, 0),
            EscapeStyle::Doubling,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.row_count, 2);
        assert!(report.truncated);
    }

    #[test]
    fn escape_style_shapes_the_column_count() {
        let mut file = NamedTempFile::new().unwrap();
        // "a\",b",9 -- two fields under backslash escaping, three under doubling
        write!(file, "\"a\\\",b\",9\n").unwrap();
        file.flush().unwrap();

        let report = analyze(
            &input(file.path(), b',', Compression::None, 0),
            EscapeStyle::Backslash,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.column_count, 2);

        let report = analyze(
            &input(file.path(), b',', Compression::None, 0),
            EscapeStyle::Doubling,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.column_count, 3);
    }

    #[test]
    fn gzip_rows_match_plain_rows() {
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv.gz");
        {
            let mut enc = GzEncoder::new(
                std::fs::File::create(&path).unwrap(),
                flate2::Compression::fast(),
            );
            for i in 0..500 {
                writeln!(enc, "{i},x{i}").unwrap();
            }
            enc.finish().unwrap();
        }

        let report = analyze(
            &input(&path, b',', Compression::Gzip, 0),
            EscapeStyle::Doubling,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.row_count, 500);
        assert_eq!(report.column_count, 2);
    }

    #[test]
    fn zero_byte_file_reports_zero_rows() {
        let file = NamedTempFile::new().unwrap();
        let report = analyze(
            &input(file.path(), b',', Compression::None, 0),
            EscapeStyle::Doubling,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.row_count, 0);
        assert_eq!(report.column_count, 0);
        assert_eq!(report.file_bytes, 0);
    }
}

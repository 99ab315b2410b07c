//! Delimiter, quote, and compression detection.
//!
//! Reads a bounded head sample (decompressed when the input is gzipped) and
//! scores candidate delimiters by field-count consistency, then absolute
//! frequency, then declared precedence. Deterministic for identical bytes.

use crate::fields::split_fields;
use crate::reader::RecordReader;
use granary_protocol::defaults::FORMAT_SAMPLE_LINES;
use granary_protocol::types::{Compression, EscapeStyle, FileDescriptor, Format};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Candidate delimiters in precedence order.
pub const DELIMITER_CANDIDATES: &[u8] = &[b'\t', b',', b'|', b';'];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: file is empty")]
    Empty { path: PathBuf },
    #[error("{path}: no delimited structure found in sample")]
    Undetermined { path: PathBuf },
}

/// Resolve a file's effective format plus a confidence in [0, 1].
///
/// Explicit descriptor overrides win (confidence 1.0) when consistent with
/// the sampled head; otherwise detection runs and the override, if any,
/// only shapes the quote default. Candidate scoring splits sampled lines
/// with the job's configured escape style.
pub fn detect_format(
    fd: &FileDescriptor,
    escape: EscapeStyle,
) -> Result<(Format, f64), FormatError> {
    let path = &fd.path;
    let meta = std::fs::metadata(path).map_err(|e| FormatError::Unreadable {
        path: path.clone(),
        source: e,
    })?;
    if meta.len() == 0 {
        return Err(FormatError::Empty { path: path.clone() });
    }

    let compression = resolve_compression(fd, path)?;
    let sample = sample_lines(path, compression)?;
    if sample.is_empty() {
        return Err(FormatError::Undetermined { path: path.clone() });
    }

    if let Some(delim) = fd.delimiter {
        let delim = delim as u8;
        if sample.iter().any(|line| line.contains(&delim)) || single_column(&sample) {
            return Ok((build_format(fd, delim, compression), 1.0));
        }
        tracing::warn!(
            file = %path.display(),
            delimiter = %delim as char,
            "explicit delimiter not seen in sample, falling back to detection"
        );
    }

    let (delim, confidence) = score_candidates(&sample, escape);
    Ok((build_format(fd, delim, compression), confidence))
}

fn resolve_compression(fd: &FileDescriptor, path: &Path) -> Result<Compression, FormatError> {
    if let Some(c) = fd.compression {
        return Ok(c);
    }
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz") || e.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    if by_extension {
        return Ok(Compression::Gzip);
    }
    // extension lies sometimes; the magic bytes do not
    let mut magic = [0u8; 2];
    let mut file = File::open(path).map_err(|e| FormatError::Unreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    let n = file.read(&mut magic).map_err(|e| FormatError::Unreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    if n == 2 && magic == GZIP_MAGIC {
        return Ok(Compression::Gzip);
    }
    Ok(Compression::None)
}

fn sample_lines(path: &Path, compression: Compression) -> Result<Vec<Vec<u8>>, FormatError> {
    let mut reader =
        RecordReader::open(path, compression).map_err(|e| FormatError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        let more = reader
            .next_record(&mut buf)
            .map_err(|e| FormatError::Unreadable {
                path: path.to_path_buf(),
                source: e,
            })?;
        if !more {
            break;
        }
        if buf.is_empty() {
            continue;
        }
        lines.push(buf.clone());
        if lines.len() >= FORMAT_SAMPLE_LINES {
            break;
        }
    }
    Ok(lines)
}

fn single_column(sample: &[Vec<u8>]) -> bool {
    DELIMITER_CANDIDATES
        .iter()
        .all(|d| sample.iter().all(|line| !line.contains(d)))
}

fn build_format(fd: &FileDescriptor, delimiter: u8, compression: Compression) -> Format {
    let mut format = Format::for_delimiter(delimiter, compression);
    if let Some(q) = fd.quote {
        format.quote = Some(q as u8);
    }
    format
}

/// Pick the best candidate: highest field-count consistency, then highest
/// occurrence count, then precedence order. A candidate that never occurs is
/// only eligible when none occurs (single-column input).
fn score_candidates(sample: &[Vec<u8>], escape: EscapeStyle) -> (u8, f64) {
    let mut best: Option<(u8, f64, u64)> = None;
    let mut scratch = Vec::new();

    for &delim in DELIMITER_CANDIDATES {
        let occurrences: u64 = sample
            .iter()
            .map(|line| line.iter().filter(|&&b| b == delim).count() as u64)
            .sum();
        if occurrences == 0 {
            continue;
        }

        let quote = Format::for_delimiter(delim, Compression::None).quote;
        let mut counts = Vec::with_capacity(sample.len());
        for line in sample {
            split_fields(line, delim, quote, escape, &mut scratch);
            counts.push(scratch.len());
        }
        let consistency = modal_fraction(&counts);

        let better = match best {
            None => true,
            Some((_, c, occ)) => {
                consistency > c + f64::EPSILON
                    || ((consistency - c).abs() <= f64::EPSILON && occurrences > occ)
            }
        };
        if better {
            best = Some((delim, consistency, occurrences));
        }
    }

    match best {
        Some((delim, consistency, _)) => (delim, consistency),
        // no candidate byte anywhere: a single-column file, delimiter moot
        None => (b'\t', 1.0),
    }
}

/// Fraction of lines sharing the modal field count.
fn modal_fraction(counts: &[usize]) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    let mut freq = std::collections::HashMap::new();
    for &c in counts {
        *freq.entry(c).or_insert(0usize) += 1;
    }
    let modal = freq.values().copied().max().unwrap_or(0);
    modal as f64 / counts.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_protocol::types::FormatKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn descriptor(path: &Path) -> FileDescriptor {
        FileDescriptor {
            path: path.to_path_buf(),
            table: "t".into(),
            date_column: "d".into(),
            expected_columns: vec![],
            delimiter: None,
            quote: None,
            compression: None,
            skip_header: 0,
        }
    }

    fn write_lines(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn detects_tsv() {
        let file = write_lines(&["a\tb\tc", "1\t2\t3", "4\t5\t6"]);
        let (format, confidence) =
            detect_format(&descriptor(file.path()), EscapeStyle::Doubling).unwrap();
        assert_eq!(format.delimiter, b'\t');
        assert_eq!(format.kind, FormatKind::Tsv);
        assert_eq!(format.quote, None);
        assert!(confidence > 0.99);
    }

    #[test]
    fn detects_csv_with_quote_default() {
        let file = write_lines(&[r#"1,"x,y",3"#, "4,5,6", "7,8,9"]);
        let (format, confidence) =
            detect_format(&descriptor(file.path()), EscapeStyle::Doubling).unwrap();
        assert_eq!(format.delimiter, b',');
        assert_eq!(format.kind, FormatKind::Csv);
        assert_eq!(format.quote, Some(b'"'));
        assert!(confidence > 0.99);
    }

    #[test]
    fn detects_pipe_and_semicolon() {
        let file = write_lines(&["1|2|3", "4|5|6"]);
        let (format, _) = detect_format(&descriptor(file.path()), EscapeStyle::Doubling).unwrap();
        assert_eq!(format.delimiter, b'|');

        let file = write_lines(&["1;2;3", "4;5;6"]);
        let (format, _) = detect_format(&descriptor(file.path()), EscapeStyle::Doubling).unwrap();
        assert_eq!(format.delimiter, b';');
    }

    #[test]
    fn frequency_breaks_consistency_ties() {
        // both ',' and '|' appear; ',' dominates and is equally consistent
        let file = write_lines(&["a,b,c|d", "e,f,g|h"]);
        let (format, _) = detect_format(&descriptor(file.path()), EscapeStyle::Doubling).unwrap();
        assert_eq!(format.delimiter, b',');
    }

    #[test]
    fn explicit_override_wins_when_consistent() {
        let file = write_lines(&["1;2;3", "4;5;6"]);
        let mut fd = descriptor(file.path());
        fd.delimiter = Some(';');
        fd.quote = Some('\'');
        let (format, confidence) = detect_format(&fd, EscapeStyle::Doubling).unwrap();
        assert_eq!(format.delimiter, b';');
        assert_eq!(format.quote, Some(b'\''));
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn inconsistent_override_falls_back_to_detection() {
        let file = write_lines(&["1,2,3", "4,5,6"]);
        let mut fd = descriptor(file.path());
        fd.delimiter = Some('|');
        let (format, _) = detect_format(&fd, EscapeStyle::Doubling).unwrap();
        assert_eq!(format.delimiter, b',');
    }

    #[test]
    fn single_column_file_is_fine() {
        let file = write_lines(&["20240101", "20240102"]);
        let (format, confidence) =
            detect_format(&descriptor(file.path()), EscapeStyle::Doubling).unwrap();
        assert_eq!(format.delimiter, b'\t');
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn zero_byte_file_is_empty_error() {
        let file = NamedTempFile::new().unwrap();
        match detect_format(&descriptor(file.path()), EscapeStyle::Doubling) {
            Err(FormatError::Empty { .. }) => {}
            other => panic!("expected Empty, got {other:?}"),
        }
    }

    #[test]
    fn gzip_by_extension_and_magic() {
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("data.tsv.gz");
        {
            let mut enc = GzEncoder::new(
                File::create(&gz_path).unwrap(),
                flate2::Compression::fast(),
            );
            enc.write_all(b"a\tb\n1\t2\n").unwrap();
            enc.finish().unwrap();
        }
        let (format, _) = detect_format(&descriptor(&gz_path), EscapeStyle::Doubling).unwrap();
        assert!(format.compression.is_gzip());
        assert_eq!(format.delimiter, b'\t');

        // same bytes, no .gz extension: the magic decides
        let plain_path = dir.path().join("data.bin");
        std::fs::copy(&gz_path, &plain_path).unwrap();
        let (format, _) = detect_format(&descriptor(&plain_path), EscapeStyle::Doubling).unwrap();
        assert!(format.compression.is_gzip());
    }

    #[test]
    fn detection_is_deterministic() {
        let file = write_lines(&["a,b", "c,d", "e,f"]);
        let first = detect_format(&descriptor(file.path()), EscapeStyle::Doubling).unwrap();
        let second = detect_format(&descriptor(file.path()), EscapeStyle::Doubling).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }
}

//! SQL text for the stage-and-copy protocol.
//!
//! Builders here take pre-validated identifiers and internally generated
//! stage paths; every user value elsewhere travels as a bound parameter.

use granary_protocol::defaults::COPY_SIZE_LIMIT_BYTES;
use granary_protocol::types::Format;

/// Cheap no-op issued by the keepalive ticker.
pub const KEEPALIVE_SQL: &str = "SELECT 1";

/// Render a delimiter byte as a single-quoted SQL literal.
fn delimiter_literal(delimiter: u8) -> String {
    match delimiter {
        b'\t' => "'\\t'".to_string(),
        b'\'' => "''''".to_string(),
        d => format!("'{}'", d as char),
    }
}

/// COPY INTO with the full option block the loader guarantees.
///
/// ABORT_STATEMENT keeps partial loads off the table; PURGE removes staged
/// files on success; the column-count mismatch check stays off because the
/// server pads short rows with NULL.
pub fn copy_into(table: &str, stage_path: &str, format: &Format, skip_header: u32) -> String {
    let enclosed = match format.quote {
        Some(b'\'') => "''''".to_string(),
        Some(q) => format!("'{}'", q as char),
        None => "NONE".to_string(),
    };
    format!(
        "COPY INTO {table} FROM '{stage_path}' \
         FILE_FORMAT = (TYPE=CSV, FIELD_DELIMITER={delim}, SKIP_HEADER={skip_header}, \
         FIELD_OPTIONALLY_ENCLOSED_BY={enclosed}, ESCAPE_UNENCLOSED_FIELD=NONE, \
         ERROR_ON_COLUMN_COUNT_MISMATCH=FALSE, REPLACE_INVALID_CHARACTERS=TRUE, \
         NULL_IF=('NULL','null','','\\\\N'), COMPRESSION=AUTO) \
         ON_ERROR=ABORT_STATEMENT PURGE=TRUE SIZE_LIMIT={size_limit}",
        delim = delimiter_literal(format.delimiter),
        size_limit = COPY_SIZE_LIMIT_BYTES,
    )
}

/// Remove every file under a stage prefix; the unconditional cleanup path.
pub fn remove_stage(stage_path: &str) -> String {
    format!("REMOVE {stage_path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_protocol::types::Compression;

    #[test]
    fn tsv_copy_statement() {
        let format = Format::for_delimiter(b'\t', Compression::Gzip);
        let sql = copy_into("sales", "@~/sales/abc/", &format, 0);
        assert!(sql.starts_with("COPY INTO sales FROM '@~/sales/abc/'"));
        assert!(sql.contains("FIELD_DELIMITER='\\t'"));
        assert!(sql.contains("SKIP_HEADER=0"));
        assert!(sql.contains("FIELD_OPTIONALLY_ENCLOSED_BY=NONE"));
        assert!(sql.contains("ERROR_ON_COLUMN_COUNT_MISMATCH=FALSE"));
        assert!(sql.contains("REPLACE_INVALID_CHARACTERS=TRUE"));
        assert!(sql.contains("NULL_IF=('NULL','null','','\\\\N')"));
        assert!(sql.contains("COMPRESSION=AUTO"));
        assert!(sql.contains("ON_ERROR=ABORT_STATEMENT"));
        assert!(sql.contains("PURGE=TRUE"));
        assert!(sql.contains("SIZE_LIMIT=5368709120"));
    }

    #[test]
    fn csv_copy_statement_quotes_and_header() {
        let format = Format::for_delimiter(b',', Compression::None);
        let sql = copy_into("sales", "@~/sales/abc/", &format, 1);
        assert!(sql.contains("FIELD_DELIMITER=','"));
        assert!(sql.contains("SKIP_HEADER=1"));
        assert!(sql.contains("FIELD_OPTIONALLY_ENCLOSED_BY='\"'"));
    }

    #[test]
    fn remove_targets_the_prefix() {
        assert_eq!(remove_stage("@~/t/u/"), "REMOVE @~/t/u/");
    }
}

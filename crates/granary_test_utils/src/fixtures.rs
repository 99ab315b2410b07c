//! Fixture file builders.

use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

/// Write rows as delimiter-joined lines with a trailing LF each.
pub fn write_delimited(path: &Path, delimiter: char, rows: &[Vec<&str>]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for row in rows {
        let line = row.join(&delimiter.to_string());
        writeln!(out, "{line}")?;
    }
    out.flush()
}

/// Gzip `src` into `dst` at the fastest level.
pub fn gzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut input = File::open(src)?;
    let mut encoder = GzEncoder::new(
        BufWriter::new(File::create(dst)?),
        flate2::Compression::fast(),
    );
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?.flush()
}

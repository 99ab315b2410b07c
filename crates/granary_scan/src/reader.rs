//! Line-oriented record reader over plain or gzipped files.
//!
//! Both scan passes ride this reader, which pins down one line-ending
//! policy: records are terminated lines (LF or CRLF, auto-detected from the
//! first line), a trailing unterminated byte run is flagged as truncation
//! and not yielded, and empty lines are yielded as empty records for the
//! caller to skip.

use flate2::read::MultiGzDecoder;
use granary_protocol::types::{Compression, LineTerminator};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const READ_BUF_BYTES: usize = 256 * 1024;

enum Inner {
    Plain(BufReader<File>),
    Gzip(BufReader<MultiGzDecoder<File>>),
}

impl Inner {
    fn read_until(&mut self, byte: u8, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Inner::Plain(r) => r.read_until(byte, buf),
            Inner::Gzip(r) => r.read_until(byte, buf),
        }
    }
}

pub struct RecordReader {
    inner: Inner,
    /// Decompressed bytes consumed, terminators included.
    bytes_read: u64,
    terminator: Option<LineTerminator>,
    truncated: bool,
    done: bool,
}

impl RecordReader {
    pub fn open(path: &Path, compression: Compression) -> io::Result<Self> {
        let file = File::open(path)?;
        let inner = match compression {
            Compression::None => Inner::Plain(BufReader::with_capacity(READ_BUF_BYTES, file)),
            Compression::Gzip => Inner::Gzip(BufReader::with_capacity(
                READ_BUF_BYTES,
                MultiGzDecoder::new(file),
            )),
        };
        Ok(Self {
            inner,
            bytes_read: 0,
            terminator: None,
            truncated: false,
            done: false,
        })
    }

    /// Read the next terminated line into `buf` (terminator stripped).
    ///
    /// Returns `Ok(false)` at end of input. A final byte run without a
    /// terminator sets the truncation flag and is not yielded.
    pub fn next_record(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        if self.done {
            return Ok(false);
        }
        buf.clear();
        let n = self.inner.read_until(b'\n', buf)?;
        if n == 0 {
            self.done = true;
            return Ok(false);
        }
        self.bytes_read += n as u64;

        if buf.last() != Some(&b'\n') {
            // EOF mid-line: round the row count down.
            self.truncated = true;
            self.done = true;
            return Ok(false);
        }
        buf.pop();
        let had_cr = buf.last() == Some(&b'\r');
        if had_cr {
            buf.pop();
        }
        if self.terminator.is_none() {
            self.terminator = Some(if had_cr {
                LineTerminator::CrLf
            } else {
                LineTerminator::Lf
            });
        }
        Ok(true)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn terminator(&self) -> LineTerminator {
        self.terminator.unwrap_or(LineTerminator::Lf)
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

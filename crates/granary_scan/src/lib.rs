//! Streaming single-pass scans over delimited input files.
//!
//! Three passes live here, all constant-memory with respect to file size:
//! format detection (head sample only), the sizing analysis pass, and the
//! data-quality pass.

pub mod analyzer;
pub mod fields;
pub mod format;
pub mod quality;
pub mod reader;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScanError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub use analyzer::analyze;
pub use format::{detect_format, FormatError};
pub use quality::{validate_quality, QualityOptions};

//! Granary CLI.
//!
//! Usage:
//!     granary scan --table sales --date-column load_date \
//!         --columns id,load_date,amount data/sales_202209.tsv
//!     granary check-config granary.json

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use granary_protocol::config::JobConfig;
use granary_protocol::progress::LogSink;
use granary_protocol::types::{FileDescriptor, ResolvedInput};
use granary_scan::quality::QualityOptions;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "granary", about = "Bulk-ingest toolkit for delimited files")]
struct Args {
    /// Mirror the file log filter onto stderr
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream files once and print their analysis and quality reports
    Scan {
        /// Input files (plain or gzipped delimited text)
        files: Vec<PathBuf>,

        /// Target table name
        #[arg(long)]
        table: String,

        /// Declared date column
        #[arg(long)]
        date_column: String,

        /// Expected column list, in order
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,

        /// Header rows to skip
        #[arg(long, default_value_t = 0)]
        skip_header: u32,

        /// Job configuration document (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse and range-check a job configuration document
    CheckConfig {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    granary_logging::init("granary", args.verbose)?;

    match args.command {
        Command::Scan {
            files,
            table,
            date_column,
            columns,
            skip_header,
            config,
        } => scan(files, table, date_column, columns, skip_header, config),
        Command::CheckConfig { path } => check_config(path),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<JobConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            JobConfig::from_json(&raw).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(JobConfig::default()),
    }
}

fn scan(
    files: Vec<PathBuf>,
    table: String,
    date_column: String,
    columns: Vec<String>,
    skip_header: u32,
    config: Option<PathBuf>,
) -> Result<()> {
    if files.is_empty() {
        bail!("no input files given");
    }
    let config = load_config(config.as_ref())?;
    let sink = LogSink;
    let options = QualityOptions {
        duplicate_key: config.duplicate_key.clone(),
        escape_style: config.escape_style,
    };

    let mut failed = 0usize;
    for path in files {
        let fd = FileDescriptor {
            path: path.clone(),
            table: table.clone(),
            date_column: date_column.clone(),
            expected_columns: columns.clone(),
            delimiter: None,
            quote: None,
            compression: None,
            skip_header,
        };
        config.validate_descriptor(&fd)?;

        match scan_one(fd, &options, &sink) {
            Ok(()) => {}
            Err(e) => {
                failed += 1;
                tracing::error!(file = %path.display(), error = %e, "scan failed");
                eprintln!("{}: {e}", path.display());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} file(s) failed to scan");
    }
    Ok(())
}

fn scan_one(
    fd: FileDescriptor,
    options: &QualityOptions,
    sink: &LogSink,
) -> Result<()> {
    let (format, confidence) = granary_scan::detect_format(&fd, options.escape_style)?;
    let input = ResolvedInput {
        descriptor: fd,
        format,
        confidence,
    };
    let analysis = granary_scan::analyze(&input, options.escape_style, sink)?;
    let quality = granary_scan::validate_quality(&input, options, sink)?;

    println!("{}", serde_json::to_string_pretty(&analysis)?);
    println!("{}", serde_json::to_string_pretty(&quality)?);
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let raw =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    JobConfig::from_json(&raw).with_context(|| format!("invalid configuration {}", path.display()))?;
    println!("{}: ok", path.display());
    Ok(())
}

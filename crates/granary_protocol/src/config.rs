//! Job configuration: a closed, validated record.
//!
//! Unknown fields are rejected at parse time so a typo surfaces as
//! CONFIG_INVALID before any work starts, not as a silently ignored knob.

use crate::defaults;
use crate::types::{EscapeStyle, FileDescriptor, Severity, ValidationPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Per-check severity for validation findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SeverityConfig {
    pub row_anomalies: Severity,
    pub invalid_dates: Severity,
    pub duplicates: Severity,
    pub completeness: Severity,
}

impl SeverityConfig {
    /// Every check fails the file instead of warning.
    pub fn strict() -> Self {
        Self {
            row_anomalies: Severity::Fail,
            invalid_dates: Severity::Fail,
            duplicates: Severity::Fail,
            completeness: Severity::Fail,
        }
    }
}

/// Tunables for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JobConfig {
    pub workers: usize,
    pub pool_capacity: usize,
    /// Compressed bytes above which COPY goes asynchronous.
    pub async_threshold_bytes: u64,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    pub keepalive_interval_secs: u64,
    pub acquire_timeout_secs: u64,
    /// Gzip level, 1..=9.
    pub compression_level: u32,
    pub parallel_uploads: usize,
    pub validation_policy: ValidationPolicy,
    pub continue_on_error: bool,
    /// Composite key for duplicate detection. No implicit default: when
    /// absent, duplicate detection is skipped.
    pub duplicate_key: Option<Vec<String>>,
    pub escape_style: EscapeStyle,
    pub severity: SeverityConfig,
    pub max_attempts: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: defaults::DEFAULT_WORKERS,
            pool_capacity: defaults::DEFAULT_POOL_CAPACITY,
            async_threshold_bytes: defaults::DEFAULT_ASYNC_THRESHOLD_BYTES,
            poll_interval_secs: defaults::DEFAULT_POLL_INTERVAL_SECS,
            max_wait_secs: defaults::DEFAULT_MAX_WAIT_SECS,
            keepalive_interval_secs: defaults::DEFAULT_KEEPALIVE_INTERVAL_SECS,
            acquire_timeout_secs: defaults::DEFAULT_ACQUIRE_TIMEOUT_SECS,
            compression_level: defaults::DEFAULT_COMPRESSION_LEVEL,
            parallel_uploads: defaults::DEFAULT_PARALLEL_UPLOADS,
            validation_policy: ValidationPolicy::default(),
            continue_on_error: true,
            duplicate_key: None,
            escape_style: EscapeStyle::default(),
            severity: SeverityConfig::default(),
            max_attempts: defaults::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl JobConfig {
    /// Parse from a JSON document, rejecting unknown fields.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every knob.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pool_capacity must be at least 1".into(),
            ));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "compression_level must be 1..=9, got {}",
                self.compression_level
            )));
        }
        if self.parallel_uploads == 0 {
            return Err(ConfigError::Invalid(
                "parallel_uploads must be at least 1".into(),
            ));
        }
        if self.poll_interval_secs == 0 || self.max_wait_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs and max_wait_secs must be non-zero".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if let Some(keys) = &self.duplicate_key {
            if keys.is_empty() {
                return Err(ConfigError::Invalid(
                    "duplicate_key, when present, must name at least one column".into(),
                ));
            }
        }
        Ok(())
    }

    /// Validate a file descriptor against this configuration.
    pub fn validate_descriptor(&self, fd: &FileDescriptor) -> Result<(), ConfigError> {
        if fd.table.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{}: table name is empty",
                fd.path.display()
            )));
        }
        if fd.date_column.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{}: date_column is empty",
                fd.path.display()
            )));
        }
        if self.validation_policy.validates_file() && fd.expected_columns.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{}: file validation requires an expected column list",
                fd.path.display()
            )));
        }
        if !fd.expected_columns.is_empty() && fd.date_column_index().is_none() {
            return Err(ConfigError::Invalid(format!(
                "{}: date_column '{}' is not in the expected column list",
                fd.path.display(),
                fd.date_column
            )));
        }
        if let (Some(d), Some(q)) = (fd.delimiter, fd.quote) {
            if d == q {
                return Err(ConfigError::Invalid(format!(
                    "{}: delimiter and quote overrides are both '{}'",
                    fd.path.display(),
                    d
                )));
            }
        }
        if let Some(d) = fd.delimiter {
            if !d.is_ascii() {
                return Err(ConfigError::Invalid(format!(
                    "{}: delimiter override must be a single ASCII byte",
                    fd.path.display()
                )));
            }
        }
        if let Some(keys) = &self.duplicate_key {
            if !fd.expected_columns.is_empty() {
                for key in keys {
                    if !fd
                        .expected_columns
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(key))
                    {
                        return Err(ConfigError::Invalid(format!(
                            "{}: duplicate_key column '{}' is not in the expected column list",
                            fd.path.display(),
                            key
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Worker parallelism never exceeds the session pool.
    pub fn effective_workers(&self) -> usize {
        self.workers.min(self.pool_capacity)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

//! Warehouse session seam.
//!
//! The pipeline talks to the warehouse exclusively through [`Session`];
//! production connectors own the wire protocol and credentials, tests use a
//! scripted double. Errors split into transient (retryable with a fresh
//! session) and permanent (the server said no).

use chrono::NaiveDate;
use granary_protocol::types::QueryId;
use std::sync::Arc;
use thiserror::Error;

/// A bound parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One result row.
pub type Row = Vec<SqlValue>;

/// Outcome of a synchronous DML statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    pub rows_loaded: u64,
}

/// Server-side status of an asynchronously submitted COPY.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyStatus {
    Running,
    Success { rows_loaded: u64 },
    Failed { code: String, message: String },
    Cancelled,
}

impl CopyStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CopyStatus::Running)
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Transport dropped; the operation may be retried on a fresh session.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The server rejected the statement; retrying will not help.
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::ConnectionLost(_))
    }
}

/// One warehouse session. Implementations must be safe to share between a
/// worker thread and its keepalive ticker.
pub trait Session: Send + Sync {
    /// Run a query with bound parameters and fetch all rows.
    fn query(&self, sql: &str, binds: &[SqlValue]) -> Result<Vec<Row>, SessionError>;

    /// Run a statement synchronously.
    fn execute(&self, sql: &str, binds: &[SqlValue]) -> Result<ExecResult, SessionError>;

    /// Submit a statement without waiting; returns the server query id.
    fn submit_async(&self, sql: &str) -> Result<QueryId, SessionError>;

    /// Poll an async statement. Query ids survive the session that
    /// submitted them, so a replacement session can resume polling.
    fn copy_status(&self, id: &QueryId) -> Result<CopyStatus, SessionError>;

    /// Best-effort server-side abort of an async statement.
    fn abort_query(&self, id: &QueryId) -> Result<(), SessionError>;

    /// Upload one part of a staged file.
    fn upload_part(
        &self,
        stage_path: &str,
        part_name: &str,
        bytes: &[u8],
    ) -> Result<(), SessionError>;

    /// Cheap no-op to defeat idle session expiry.
    fn ping(&self) -> Result<(), SessionError>;

    /// Tear down the underlying connection.
    fn close(&self) {}
}

/// Creates sessions for the pool.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn Session>, SessionError>;
}

//! Scripted warehouse double.
//!
//! One [`MockWarehouse`] holds the shared script and call record; every
//! session its connector hands out talks to the same state, so a
//! replacement session after a "connection loss" sees the same query ids
//! and table contents, exactly like a real warehouse.

use chrono::NaiveDate;
use granary_protocol::dates::parse_load_date;
use granary_protocol::types::QueryId;
use granary_warehouse::session::{
    Connector, CopyStatus, ExecResult, Row, Session, SessionError, SqlValue,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MockState {
    // call record
    executed: Mutex<Vec<String>>,
    uploaded: Mutex<Vec<(String, String, usize)>>,
    aborted: Mutex<Vec<QueryId>>,
    pings: AtomicU32,
    connections: AtomicU32,
    submissions: AtomicU32,

    // script
    copy_rows: AtomicU64,
    /// Number of Running responses before the COPY turns terminal.
    running_polls: AtomicU32,
    /// Session calls that fail with ConnectionLost before behaving again.
    transient_errors: AtomicU32,
    /// Status polls that fail with ConnectionLost before behaving again.
    poll_transients: AtomicU32,
    copy_failure: Mutex<Option<(String, String)>>,
    fail_remove: AtomicBool,
    fail_upload: AtomicBool,

    // table the completeness queries run against
    schema: Mutex<Vec<(String, String)>>,
    table_dates: Mutex<BTreeMap<NaiveDate, u64>>,
    duplicate_rows: AtomicU64,
}

/// Handle owning the script and the inspection surface.
#[derive(Clone, Default)]
pub struct MockWarehouse {
    state: Arc<MockState>,
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(MockConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub fn session(&self) -> Arc<dyn Session> {
        Arc::new(MockSession {
            state: Arc::clone(&self.state),
        })
    }

    // --- scripting ---

    pub fn set_copy_rows(&self, rows: u64) {
        self.state.copy_rows.store(rows, Ordering::SeqCst);
    }

    pub fn set_running_polls(&self, polls: u32) {
        self.state.running_polls.store(polls, Ordering::SeqCst);
    }

    /// The next `count` session calls fail with a transport error.
    pub fn inject_transient_errors(&self, count: u32) {
        self.state.transient_errors.store(count, Ordering::SeqCst);
    }

    /// The next `count` COPY status polls fail with a transport error.
    pub fn inject_poll_transient_errors(&self, count: u32) {
        self.state.poll_transients.store(count, Ordering::SeqCst);
    }

    pub fn set_copy_failure(&self, code: &str, message: &str) {
        *self.state.copy_failure.lock().unwrap() = Some((code.into(), message.into()));
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.state.fail_remove.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_upload(&self, fail: bool) {
        self.state.fail_upload.store(fail, Ordering::SeqCst);
    }

    pub fn set_schema(&self, columns: &[(&str, &str)]) {
        *self.state.schema.lock().unwrap() = columns
            .iter()
            .map(|(n, t)| (n.to_string(), t.to_string()))
            .collect();
    }

    pub fn set_table_dates(&self, counts: &[(NaiveDate, u64)]) {
        *self.state.table_dates.lock().unwrap() = counts.iter().copied().collect();
    }

    pub fn set_duplicate_rows(&self, rows: u64) {
        self.state.duplicate_rows.store(rows, Ordering::SeqCst);
    }

    // --- inspection ---

    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().unwrap().clone()
    }

    pub fn uploaded_parts(&self) -> Vec<(String, String, usize)> {
        self.state.uploaded.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<QueryId> {
        self.state.aborted.lock().unwrap().clone()
    }

    pub fn pings(&self) -> u32 {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }
}

pub struct MockConnector {
    state: Arc<MockState>,
}

impl Connector for MockConnector {
    fn connect(&self) -> Result<Arc<dyn Session>, SessionError> {
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Atomically consume one unit from a countdown counter.
fn take_one(counter: &AtomicU32) -> bool {
    let mut current = counter.load(Ordering::SeqCst);
    while current > 0 {
        match counter.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
    false
}

struct MockSession {
    state: Arc<MockState>,
}

impl MockSession {
    fn take_transient(&self) -> Option<SessionError> {
        if take_one(&self.state.transient_errors) {
            Some(SessionError::ConnectionLost(
                "injected transport failure".into(),
            ))
        } else {
            None
        }
    }

    fn record(&self, sql: &str) {
        self.state.executed.lock().unwrap().push(sql.to_string());
    }

    fn window(&self, binds: &[SqlValue]) -> (NaiveDate, NaiveDate) {
        let parse = |v: &SqlValue| -> Option<NaiveDate> {
            match v {
                SqlValue::Date(d) => Some(*d),
                SqlValue::Str(s) => parse_load_date(s),
                SqlValue::Int(i) => parse_load_date(&i.to_string()),
                _ => None,
            }
        };
        let start = binds.first().and_then(parse).unwrap_or(NaiveDate::MIN);
        let end = binds.get(1).and_then(parse).unwrap_or(NaiveDate::MAX);
        (start, end)
    }

    fn dates_in(&self, binds: &[SqlValue]) -> Vec<(NaiveDate, u64)> {
        let (start, end) = self.window(binds);
        self.state
            .table_dates
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| **d >= start && **d <= end)
            .map(|(d, c)| (*d, *c))
            .collect()
    }
}

impl Session for MockSession {
    fn query(&self, sql: &str, binds: &[SqlValue]) -> Result<Vec<Row>, SessionError> {
        if let Some(e) = self.take_transient() {
            return Err(e);
        }
        self.record(sql);

        if sql.contains("information_schema") {
            return Ok(self
                .state
                .schema
                .lock()
                .unwrap()
                .iter()
                .map(|(n, t)| vec![SqlValue::Str(n.clone()), SqlValue::Str(t.clone())])
                .collect());
        }
        if sql.contains("COUNT(DISTINCT") {
            let dups = self.state.duplicate_rows.load(Ordering::SeqCst);
            return Ok(vec![vec![SqlValue::Int(dups as i64)]]);
        }
        if sql.contains("SELECT DISTINCT") {
            return Ok(self
                .dates_in(binds)
                .into_iter()
                .map(|(d, _)| vec![SqlValue::Date(d)])
                .collect());
        }
        if sql.contains("GROUP BY") {
            return Ok(self
                .dates_in(binds)
                .into_iter()
                .map(|(d, c)| vec![SqlValue::Date(d), SqlValue::Int(c as i64)])
                .collect());
        }
        if sql.contains("COUNT(*)") {
            let total: u64 = self.dates_in(binds).iter().map(|(_, c)| c).sum();
            return Ok(vec![vec![SqlValue::Int(total as i64)]]);
        }
        Ok(vec![])
    }

    fn execute(&self, sql: &str, _binds: &[SqlValue]) -> Result<ExecResult, SessionError> {
        if let Some(e) = self.take_transient() {
            return Err(e);
        }
        self.record(sql);

        if sql.starts_with("COPY INTO") {
            if let Some((code, message)) = self.state.copy_failure.lock().unwrap().clone() {
                return Err(SessionError::Server { code, message });
            }
            return Ok(ExecResult {
                rows_loaded: self.state.copy_rows.load(Ordering::SeqCst),
            });
        }
        if sql.starts_with("REMOVE") && self.state.fail_remove.load(Ordering::SeqCst) {
            return Err(SessionError::Server {
                code: "000603".into(),
                message: "stage unavailable".into(),
            });
        }
        Ok(ExecResult::default())
    }

    fn submit_async(&self, sql: &str) -> Result<QueryId, SessionError> {
        if let Some(e) = self.take_transient() {
            return Err(e);
        }
        self.record(sql);
        let n = self.state.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(QueryId::new(format!("query-{n}")))
    }

    fn copy_status(&self, _id: &QueryId) -> Result<CopyStatus, SessionError> {
        if let Some(e) = self.take_transient() {
            return Err(e);
        }
        if take_one(&self.state.poll_transients) {
            return Err(SessionError::ConnectionLost(
                "injected transport failure during poll".into(),
            ));
        }
        if take_one(&self.state.running_polls) {
            return Ok(CopyStatus::Running);
        }
        if let Some((code, message)) = self.state.copy_failure.lock().unwrap().clone() {
            return Ok(CopyStatus::Failed { code, message });
        }
        Ok(CopyStatus::Success {
            rows_loaded: self.state.copy_rows.load(Ordering::SeqCst),
        })
    }

    fn abort_query(&self, id: &QueryId) -> Result<(), SessionError> {
        self.state.aborted.lock().unwrap().push(id.clone());
        Ok(())
    }

    fn upload_part(
        &self,
        stage_path: &str,
        part_name: &str,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        if self.state.fail_upload.load(Ordering::SeqCst) {
            return Err(SessionError::ConnectionLost("upload interrupted".into()));
        }
        self.state.uploaded.lock().unwrap().push((
            stage_path.to_string(),
            part_name.to_string(),
            bytes.len(),
        ));
        Ok(())
    }

    fn ping(&self) -> Result<(), SessionError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

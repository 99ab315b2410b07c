//! Fixed-capacity session pool with FIFO leasing and keepalive.
//!
//! Waiters are served strictly in arrival order via ticket numbers. A lease
//! is a guard that returns the session on drop; marking it unhealthy closes
//! the session instead, and the next acquire opens a replacement.

use crate::session::{Connector, Session, SessionError};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session available within {0:?}")]
    AcquireTimeout(Duration),
    #[error("pool is closed")]
    Closed,
    #[error("failed to open session: {0}")]
    Connect(#[source] SessionError),
}

struct PoolState {
    idle: VecDeque<Arc<dyn Session>>,
    /// Sessions in existence, idle or leased.
    open: usize,
    leased: usize,
    next_ticket: u64,
    now_serving: u64,
    /// Tickets whose waiter gave up; skipped when their turn comes.
    abandoned: HashSet<u64>,
    closed: bool,
}

impl PoolState {
    fn skip_abandoned(&mut self) {
        while self.abandoned.remove(&self.now_serving) {
            self.now_serving += 1;
        }
    }
}

struct PoolInner {
    connector: Box<dyn Connector>,
    capacity: usize,
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl PoolInner {
    fn release(&self, session: Arc<dyn Session>, unhealthy: bool) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.leased -= 1;
        if state.closed || unhealthy {
            if unhealthy {
                warn!("discarding unhealthy session");
            }
            session.close();
            state.open -= 1;
        } else {
            state.idle.push_back(session);
        }
        self.cond.notify_all();
    }
}

/// Bounded pool of warehouse sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: Box<dyn Connector>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                capacity: capacity.max(1),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    open: 0,
                    leased: 0,
                    next_ticket: 0,
                    now_serving: 0,
                    abandoned: HashSet::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn leased(&self) -> usize {
        self.inner.state.lock().expect("pool lock poisoned").leased
    }

    /// Lease a session, waiting at most `timeout`. FIFO among waiters.
    pub fn acquire(&self, timeout: Duration) -> Result<PooledSession, PoolError> {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        let mut state = inner.state.lock().expect("pool lock poisoned");
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.skip_abandoned();

            if state.now_serving == ticket {
                if let Some(session) = state.idle.pop_front() {
                    state.leased += 1;
                    state.now_serving += 1;
                    state.skip_abandoned();
                    inner.cond.notify_all();
                    return Ok(PooledSession::new(session, Arc::clone(inner)));
                }
                if state.open < inner.capacity {
                    state.open += 1;
                    state.leased += 1;
                    state.now_serving += 1;
                    state.skip_abandoned();
                    inner.cond.notify_all();
                    drop(state);

                    debug!("opening warehouse session");
                    match inner.connector.connect() {
                        Ok(session) => return Ok(PooledSession::new(session, Arc::clone(inner))),
                        Err(e) => {
                            let mut state = inner.state.lock().expect("pool lock poisoned");
                            state.open -= 1;
                            state.leased -= 1;
                            inner.cond.notify_all();
                            return Err(PoolError::Connect(e));
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if state.now_serving == ticket {
                    state.now_serving += 1;
                    state.skip_abandoned();
                    inner.cond.notify_all();
                } else {
                    state.abandoned.insert(ticket);
                }
                return Err(PoolError::AcquireTimeout(timeout));
            }
            let (guard, _) = inner
                .cond
                .wait_timeout(state, deadline - now)
                .expect("pool lock poisoned");
            state = guard;
        }
    }

    /// Close the pool: drain waiters with [`PoolError::Closed`] and close
    /// idle sessions. Leased sessions are closed as they come back.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        state.closed = true;
        while let Some(session) = state.idle.pop_front() {
            session.close();
            state.open -= 1;
        }
        self.inner.cond.notify_all();
    }
}

/// A leased session; returns to the pool on drop.
pub struct PooledSession {
    session: Option<Arc<dyn Session>>,
    inner: Arc<PoolInner>,
    unhealthy: AtomicBool,
}

impl PooledSession {
    fn new(session: Arc<dyn Session>, inner: Arc<PoolInner>) -> Self {
        Self {
            session: Some(session),
            inner,
            unhealthy: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        self.session.as_ref().expect("session present until drop")
    }

    /// The session will be closed instead of reused when the lease ends.
    pub fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::SeqCst);
    }

    /// Start the keepalive ticker for this lease. The ticker pings on its
    /// own thread until the guard drops or the session stops answering.
    pub fn start_keepalive(&self, interval: Duration) -> KeepaliveGuard {
        KeepaliveGuard::start(Arc::clone(self.session()), interval)
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.inner
                .release(session, self.unhealthy.load(Ordering::SeqCst));
        }
    }
}

/// Stops the keepalive thread on drop.
pub struct KeepaliveGuard {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveGuard {
    fn start(session: Arc<dyn Session>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_thread = Arc::clone(&stop);
        let handle = std::thread::spawn(move || loop {
            {
                let (lock, cond) = &*stop_thread;
                let stopped = lock.lock().expect("keepalive lock poisoned");
                if *stopped {
                    break;
                }
                let (stopped, wait) = cond
                    .wait_timeout(stopped, interval)
                    .expect("keepalive lock poisoned");
                if *stopped {
                    break;
                }
                if !wait.timed_out() {
                    continue;
                }
            }
            if let Err(e) = session.ping() {
                warn!(error = %e, "keepalive ping failed; ticker stopping");
                break;
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for KeepaliveGuard {
    fn drop(&mut self) {
        let (lock, cond) = &*self.stop;
        *lock.lock().expect("keepalive lock poisoned") = true;
        cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CopyStatus, ExecResult, Row, SqlValue};
    use granary_protocol::types::QueryId;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct TestSession {
        pings: AtomicUsize,
    }

    impl Session for TestSession {
        fn query(&self, _sql: &str, _binds: &[SqlValue]) -> Result<Vec<Row>, SessionError> {
            Ok(vec![])
        }
        fn execute(&self, _sql: &str, _binds: &[SqlValue]) -> Result<ExecResult, SessionError> {
            Ok(ExecResult::default())
        }
        fn submit_async(&self, _sql: &str) -> Result<QueryId, SessionError> {
            Ok(QueryId::new("q"))
        }
        fn copy_status(&self, _id: &QueryId) -> Result<CopyStatus, SessionError> {
            Ok(CopyStatus::Running)
        }
        fn abort_query(&self, _id: &QueryId) -> Result<(), SessionError> {
            Ok(())
        }
        fn upload_part(&self, _s: &str, _p: &str, _b: &[u8]) -> Result<(), SessionError> {
            Ok(())
        }
        fn ping(&self) -> Result<(), SessionError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct TestConnector {
        connections: Arc<AtomicUsize>,
        last: Arc<Mutex<Option<Arc<TestSession>>>>,
    }

    impl Connector for TestConnector {
        fn connect(&self) -> Result<Arc<dyn Session>, SessionError> {
            self.connections.fetch_add(1, Ordering::SeqCst);
            let session = Arc::new(TestSession::default());
            *self.last.lock().unwrap() = Some(Arc::clone(&session));
            Ok(session)
        }
    }

    #[test]
    fn capacity_one_blocks_second_acquire() {
        let pool = ConnectionPool::new(Box::<TestConnector>::default(), 1);
        let lease = pool.acquire(Duration::from_millis(100)).unwrap();
        assert_eq!(pool.leased(), 1);

        match pool.acquire(Duration::from_millis(50)) {
            Err(PoolError::AcquireTimeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }

        drop(lease);
        assert_eq!(pool.leased(), 0);
        let _lease = pool.acquire(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn sessions_are_reused() {
        let connector = TestConnector::default();
        let connections = Arc::clone(&connector.connections);
        let pool = ConnectionPool::new(Box::new(connector), 2);

        let lease = pool.acquire(Duration::from_millis(100)).unwrap();
        drop(lease);
        let lease = pool.acquire(Duration::from_millis(100)).unwrap();
        drop(lease);

        // one physical session served both leases
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unhealthy_session_is_replaced() {
        let connector = TestConnector::default();
        let connections = Arc::clone(&connector.connections);
        let pool = ConnectionPool::new(Box::new(connector), 1);

        let lease = pool.acquire(Duration::from_millis(100)).unwrap();
        lease.mark_unhealthy();
        drop(lease);

        let _lease = pool.acquire(Duration::from_millis(100)).unwrap();
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn waiters_are_served_fifo() {
        let pool = ConnectionPool::new(Box::<TestConnector>::default(), 1);
        let first = pool.acquire(Duration::from_secs(1)).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order = Arc::clone(&order);
            handles.push(std::thread::spawn(move || {
                let lease = pool.acquire(Duration::from_secs(5)).unwrap();
                order.lock().unwrap().push(i);
                drop(lease);
            }));
            // stagger arrival so ticket order matches spawn order
            std::thread::sleep(Duration::from_millis(50));
        }

        drop(first);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn close_drains_waiters() {
        let pool = ConnectionPool::new(Box::<TestConnector>::default(), 1);
        let _lease = pool.acquire(Duration::from_secs(1)).unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        pool.close();

        match waiter.join().unwrap() {
            Err(PoolError::Closed) => {}
            other => panic!("expected Closed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn abandoned_ticket_does_not_stall_the_line() {
        let pool = ConnectionPool::new(Box::<TestConnector>::default(), 1);
        let lease = pool.acquire(Duration::from_secs(1)).unwrap();

        // this waiter gives up before being served
        assert!(matches!(
            pool.acquire(Duration::from_millis(30)),
            Err(PoolError::AcquireTimeout(_))
        ));

        drop(lease);
        // the line must keep moving
        let _lease = pool.acquire(Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn keepalive_pings_until_dropped() {
        let connector = TestConnector::default();
        let last = Arc::clone(&connector.last);
        let pool = ConnectionPool::new(Box::new(connector), 1);

        let lease = pool.acquire(Duration::from_millis(100)).unwrap();
        let guard = lease.start_keepalive(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(100));
        drop(guard);

        let session = last.lock().unwrap().clone().unwrap();
        let pinged = session.pings.load(Ordering::SeqCst);
        assert!(pinged >= 3, "expected several pings, got {pinged}");

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(session.pings.load(Ordering::SeqCst), pinged);
    }
}

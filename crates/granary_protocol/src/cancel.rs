//! Cooperative cancellation shared between the orchestrator and workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clone-cheap cancellation flag. Workers check it between phases and on
/// every poll tick; nothing is interrupted mid-syscall.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

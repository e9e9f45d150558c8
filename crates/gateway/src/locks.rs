//! Per-thread concurrency control.
//!
//! At most one run (fresh or resumed) is in flight per thread id. A
//! second request while a run is active is rejected with a structured
//! busy error rather than queued — the client owns the retry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

pub struct ThreadLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for ThreadLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the run lock for a thread without waiting. Hold the
    /// permit for the duration of the run — it releases on drop.
    pub fn try_acquire(&self, thread_id: &str) -> Result<OwnedSemaphorePermit, ThreadBusy> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(thread_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        match sem.try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => Err(ThreadBusy),
        }
    }

    /// Number of tracked threads (for monitoring).
    pub fn thread_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop semaphores for threads with no active run.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

/// A run is already in progress on this thread.
#[derive(Debug)]
pub struct ThreadBusy;

impl std::fmt::Display for ThreadBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread is busy — a run is already in progress")
    }
}

impl std::error::Error for ThreadBusy {}

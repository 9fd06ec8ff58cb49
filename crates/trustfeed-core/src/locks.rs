//! Per-identifier async locks with a liveness timeout
//!
//! A lock that cannot be acquired within the timeout is assumed wedged: it
//! is replaced by a fresh one, a warning is logged and the caller proceeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

pub type LockGuard = OwnedMutexGuard<()>;

pub struct Locks {
    timeout: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Locks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        // Forget locks nobody holds or waits for
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        locks.entry(id.to_string()).or_default().clone()
    }

    pub async fn lock(&self, id: &str) -> LockGuard {
        let lock = self.entry(id);
        match tokio::time::timeout(self.timeout, lock.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    lock = id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "lock timed out, forcing release"
                );
                let fresh = Arc::new(tokio::sync::Mutex::new(()));
                self.locks.lock().insert(id.to_string(), fresh.clone());
                fresh.lock_owned().await
            }
        }
    }

    /// Identifiers with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

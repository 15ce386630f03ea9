//! Per-layer mutual exclusion.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of async locks keyed by layer graph id.
///
/// Entries are created on first use and dropped once no task holds or waits
/// on them, so the map stays proportional to the number of layers currently
/// being fetched. Locks are not reentrant: acquiring the same key twice from
/// one task deadlocks.
#[derive(Debug, Default)]
pub struct LayerLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held lock on one layer id; releases on drop.
#[derive(Debug)]
pub struct LayerLockGuard<'a> {
    owner: &'a LayerLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LayerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Dropping the returned future before it completes leaves no entry behind.
    pub async fn acquire(&self, key: &str) -> LayerLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        let pending = PendingLock {
            owner: self,
            key: key.to_string(),
            lock: Some(Arc::clone(&lock)),
        };
        let guard = lock.lock_owned().await;
        drop(pending);

        LayerLockGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Drop the entry for `key` once nobody but the map references it.
    fn release_if_idle(&self, key: &str) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(key)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(key);
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A waiter's reference to a lock entry, cleaned up if the wait is cancelled.
struct PendingLock<'a> {
    owner: &'a LayerLocks,
    key: String,
    lock: Option<Arc<AsyncMutex<()>>>,
}

impl Drop for PendingLock<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.owner.release_if_idle(&self.key);
    }
}

impl Drop for LayerLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.owner.release_if_idle(&self.key);
    }
}

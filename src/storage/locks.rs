//! Per-identity write locks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serialises writers that touch the same container or blob.
///
/// Entries are created on demand and removed by [`LockTable::prune`] once no
/// task holds or waits on them.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drops idle entries and returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Lock key for a container.
pub fn container_lock_key(account: &str, container: &str) -> String {
    format!("{}/{}", account, container)
}

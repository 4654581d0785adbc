//! Per-key mutual exclusion.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

/// One async lock per key. Holders of different keys never wait on each
/// other. A key's entry lives only while someone holds or waits for it.
pub struct KeyedLocks<K> {
    locks: LockMap<K>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for the lock of `key`. It is released when the guard drops.
    pub async fn lock(&self, key: &K) -> KeyedGuard<K> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        KeyedGuard {
            key: key.clone(),
            locks: self.locks.clone(),
            guard: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held lock of one key.
pub struct KeyedGuard<K: Eq + Hash> {
    key: K,
    locks: LockMap<K>,
    guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // Only the map and this guard reference an idle lock. New lockers
        // clone under the map lock.
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks.get(&self.key).is_some_and(|lock| {
            Arc::ptr_eq(lock, OwnedMutexGuard::mutex(&self.guard)) && Arc::strong_count(lock) == 2
        });
        if idle {
            locks.remove(&self.key);
        }
    }
}

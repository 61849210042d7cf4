//! Per-key async mutual exclusion.
//!
//! One `tokio::sync::Mutex` per active key, created on first use and dropped
//! when the last guard for it is released. Different keys never contend; the
//! map itself is only held for the get-or-create and cleanup steps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

type LockMap = HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>;

/// Map of per-key locks (one per doc or project).
#[derive(Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<LockMap>>,
}

/// Held lock for one key; releases (and garbage-collects) on drop.
pub struct KeyGuard {
    key: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<tokio::sync::Mutex<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Waiters are served in FIFO order.
    pub async fn lock(&self, key: Uuid) -> KeyGuard {
        let mutex = {
            let mut locks = lock_map(&self.locks);
            locks.entry(key).or_default().clone()
        };
        let guard = mutex.clone().lock_owned().await;
        KeyGuard {
            key,
            guard: Some(guard),
            mutex,
            locks: self.locks.clone(),
        }
    }

    /// Whether any task currently holds or waits for `key`.
    pub fn is_locked(&self, key: &Uuid) -> bool {
        lock_map(&self.locks).contains_key(key)
    }

    /// Number of keys with a holder or waiter.
    pub fn active(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

impl KeyGuard {
    pub fn key(&self) -> Uuid {
        self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        // The map and this guard hold the only references: nobody is waiting.
        if Arc::strong_count(&self.mutex) == 2 {
            locks.remove(&self.key);
        }
    }
}

fn lock_map(locks: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = KeyedLocks::new();
        let key = Uuid::new_v4();
        {
            let guard = locks.lock(key).await;
            assert_eq!(guard.key(), key);
            assert!(locks.is_locked(&key));
        }
        assert!(!locks.is_locked(&key));
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let key = Uuid::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(key).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uuid::new_v4())).await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = Arc::new(KeyedLocks::new());
        let key = Uuid::new_v4();
        let first = locks.lock(key).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(first);
        assert!(locks.is_locked(&key) || waiter.is_finished());

        waiter.await.unwrap();
        assert!(!locks.is_locked(&key));
    }
}

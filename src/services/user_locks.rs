//! Per-user mutual exclusion.
//!
//! Exchanges for the same user key run one at a time; exchanges for different keys
//! never wait on each other. Uses DashMap so lookups on different keys do not contend
//! on a single lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::balance::UserKey;

type LockTable = DashMap<UserKey, Arc<Mutex<()>>>;

/// Registry of one async mutex per user key with at least one holder or waiter.
#[derive(Debug, Clone, Default)]
pub struct UserLocks {
    locks: Arc<LockTable>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_key`.
    ///
    /// The guard is `'static` so it can move into a spawned task. Dropping this future
    /// while it waits still evicts the entry if nobody else uses it.
    pub async fn lock(&self, user_key: UserKey) -> UserLockGuard {
        let cleanup = EntryCleanup {
            locks: Arc::clone(&self.locks),
            user_key,
        };
        let mutex = self
            .locks
            .entry(user_key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;

        UserLockGuard {
            _guard: guard,
            cleanup,
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one user key, released on drop.
#[derive(Debug)]
pub struct UserLockGuard {
    // Field order matters: the mutex guard is released before the entry is checked.
    _guard: OwnedMutexGuard<()>,
    cleanup: EntryCleanup,
}

impl UserLockGuard {
    pub fn user_key(&self) -> UserKey {
        self.cleanup.user_key
    }
}

/// Evicts the table entry on drop once only the table references its mutex.
#[derive(Debug)]
struct EntryCleanup {
    locks: Arc<LockTable>,
    user_key: UserKey,
}

impl Drop for EntryCleanup {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.user_key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = UserLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(1001).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = UserLocks::new();
        let _first = locks.lock(1).await;

        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
        assert!(second.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = UserLocks::new();
        {
            let guard = locks.lock(42).await;
            assert_eq!(guard.user_key(), 42);
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = UserLocks::new();
        let first = locks.lock(7).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(7).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leave_entry() {
        let locks = UserLocks::new();
        let holder = locks.lock(9).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(9).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Release first, then cancel the waiter before it is polled again.
        drop(holder);
        waiter.abort();
        let _ = waiter.await;

        assert!(locks.is_empty());
    }
}

//! Per-author write serialization.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Map size above which idle keys are dropped on the next insert.
const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per key. Holders of the same key run one at a time;
/// different keys never contend beyond the map lookup. Keys nobody holds
/// or waits on are pruned once the map grows past [`PRUNE_THRESHOLD`].
#[derive(Default)]
pub struct AuthorLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl AuthorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let existing = self.locks.read().await.get(key).cloned();
        let mutex = match existing {
            Some(mutex) => mutex,
            None => {
                let mut locks = self.locks.write().await;
                if locks.len() >= PRUNE_THRESHOLD {
                    retain_busy(&mut locks);
                }
                Arc::clone(locks.entry(key.to_string()).or_default())
            }
        };
        mutex.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub async fn key_count(&self) -> usize {
        self.locks.read().await.len()
    }
}

/// A mutex only the map references is idle: every holder or waiter keeps
/// its own `Arc` clone, and new lookups go through the map lock.
fn retain_busy(locks: &mut HashMap<String, Arc<Mutex<()>>>) {
    locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(AuthorLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("u1").await;
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
        assert_eq!(locks.key_count().await, 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = AuthorLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn held_keys_survive_pruning() {
        let locks = AuthorLocks::new();
        let held = locks.lock("busy").await;
        for i in 0..PRUNE_THRESHOLD {
            drop(locks.lock(&format!("author-{i}")).await);
        }
        assert!(locks.key_count().await < PRUNE_THRESHOLD);

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.lock("busy")).await;
        assert!(blocked.is_err(), "pruning replaced a held mutex");

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(100), locks.lock("busy")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn map_stays_bounded_under_many_authors() {
        let locks = AuthorLocks::new();
        for i in 0..(PRUNE_THRESHOLD * 3) {
            drop(locks.lock(&format!("author-{i}")).await);
        }
        assert!(locks.key_count().await <= PRUNE_THRESHOLD);
    }
}

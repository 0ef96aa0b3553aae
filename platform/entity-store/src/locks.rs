//! Per-key async locking.
//!
//! Postgres's `UPDATE ... WHERE status = 'PENDING'` already makes the
//! actual row mutation atomic across processes. `EntityLocks` exists for
//! the read-modify-write spans that wrap that update in-process: a handler
//! that reads the current vote tally, decides whether quorum is reached,
//! and only then writes the decision needs those steps to run as one unit
//! with respect to other handlers touching the same subject, or two
//! concurrently delivered responses can both observe "quorum not yet
//! reached" and both skip finalizing.
//!
//! Keys are arbitrary `Hash + Eq` values (an invoice id, a customer id, a
//! `(invoice_id, product_id, compensation_type)` tuple). Locking a key that
//! has never been seen creates it; the map only grows for the lifetime of
//! the process, which is acceptable for the bounded set of in-flight sagas
//! a single instance handles.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;

pub struct EntityLocks<K> {
    rows: StdMutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for EntityLocks<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> EntityLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            rows: StdMutex::new(HashMap::new()),
        }
    }

    fn row_mutex(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut rows = self.rows.lock().expect("entity lock map poisoned");
        rows.entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock for `key`. Other callers locking the
    /// same key wait; callers locking a different key proceed concurrently.
    pub async fn with_lock<F, Fut, T>(&self, key: &K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let row = self.row_mutex(key);
        let _guard = row.lock().await;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks: EntityLocks<String> = EntityLocks::new();
        let counter = Arc::new(AtomicU32::new(0));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let locks = &locks;
            let counter = counter.clone();
            let order = order.clone();
            handles.push(async move {
                locks
                    .with_lock(&"invoice-1".to_string(), || async {
                        let before = counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        order.lock().unwrap().push((i, before));
                    })
                    .await;
            });
        }

        futures::future::join_all(handles).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let locks: EntityLocks<String> = EntityLocks::new();
        let start = std::time::Instant::now();

        let a = locks.with_lock(&"a".to_string(), || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        let b = locks.with_lock(&"b".to_string(), || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        futures::future::join(a, b).await;
        assert!(start.elapsed() < Duration::from_millis(95));
    }
}

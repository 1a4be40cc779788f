//! Per-peer serialization. Every mutating `SessionBuilder`/
//! `SessionCipher` method runs its body inside `PeerQueue::run_exclusive`
//! for that peer's bucket key, so two jobs for the same address never
//! interleave while jobs for different addresses run fully in parallel.
//!
//! Implemented as a lazily created per-key `tokio::sync::Mutex` held across
//! the job, rather than a mailbox/worker pair; torn down once the last
//! waiter drains so the process-wide map never grows unbounded from
//! addresses seen once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

struct Bucket {
    lock: AsyncMutex<()>,
    completed: AtomicUsize,
}

/// Process-wide bucket map. Kept behind a single synchronized handle and
/// never exposed directly — callers only see `run_exclusive`.
#[derive(Default)]
pub struct PeerQueue {
    buckets: SyncMutex<HashMap<String, Arc<Bucket>>>,
}

impl PeerQueue {
    pub fn new() -> Self {
        PeerQueue::default()
    }

    /// Run `job` with exclusive access for `bucket_key`. `gc_limit` bounds
    /// how many completions a bucket absorbs before a compaction log fires
    /// (the bucket itself is torn down opportunistically as soon as no
    /// other caller is waiting, independent of that count).
    pub async fn run_exclusive<F, Fut, T>(&self, bucket_key: &str, gc_limit: usize, job: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let bucket = {
            let mut buckets = self.buckets.lock();
            buckets
                .entry(bucket_key.to_string())
                .or_insert_with(|| {
                    Arc::new(Bucket {
                        lock: AsyncMutex::new(()),
                        completed: AtomicUsize::new(0),
                    })
                })
                .clone()
        };

        let guard = bucket.lock.lock().await;
        let result = job().await;
        drop(guard);

        let completed = bucket.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if completed % gc_limit.max(1) == 0 {
            tracing::debug!(bucket = bucket_key, completed, "peer queue: gc_limit reached, compacting");
        }

        // Tear down the entry once we're the last holder: the map's own
        // clone plus ours is 2; anything higher means another job queued
        // behind us and the bucket must survive for it.
        if Arc::strong_count(&bucket) <= 2 {
            let mut buckets = self.buckets.lock();
            if let Some(current) = buckets.get(bucket_key) {
                if Arc::ptr_eq(current, &bucket) && Arc::strong_count(current) <= 2 {
                    buckets.remove(bucket_key);
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn same_bucket_serializes() {
        let queue = Arc::new(PeerQueue::new());
        let counter = Arc::new(AtomicU32::new(0));
        let order = Arc::new(SyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let queue = queue.clone();
            let counter = counter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run_exclusive("alice.1", 10_000, || async {
                        let before = counter.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        order.lock().push((i, before));
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn different_buckets_run_concurrently() {
        let queue = Arc::new(PeerQueue::new());
        let a = queue.clone();
        let b = queue.clone();
        let (tx_a, rx_a) = tokio::sync::oneshot::channel::<()>();
        let (tx_b, rx_b) = tokio::sync::oneshot::channel::<()>();

        let handle_a = tokio::spawn(async move {
            a.run_exclusive("alice.1", 10_000, || async move {
                rx_b.await.ok();
                tx_a.send(()).ok();
            })
            .await;
        });
        let handle_b = tokio::spawn(async move {
            b.run_exclusive("bob.1", 10_000, || async move {
                tx_b.send(()).ok();
                rx_a.await.ok();
            })
            .await;
        });

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            handle_a.await.unwrap();
            handle_b.await.unwrap();
        })
        .await
        .expect("distinct buckets must not deadlock on each other");
    }
}

//! Quiescence latch: waits until a churning count of in-flight operations
//! settles at zero.
//!
//! Writers bump an atomic counter and then publish the new value on a
//! conflated [`tokio::sync::watch`] channel. The waiter only uses the channel
//! as a wake-up: after every notification it re-reads the atomic, so a stale
//! value published out of order can never make it return early or hang.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;

/// Counter of in-flight operations with an async "wait for zero".
#[derive(Debug)]
pub struct QuiescenceLatch {
    count: AtomicUsize,
    latest: watch::Sender<usize>,
}

impl Default for QuiescenceLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl QuiescenceLatch {
    /// Create a latch at zero.
    pub fn new() -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            count: AtomicUsize::new(0),
            latest,
        }
    }

    /// Register one more in-flight operation and return the new count.
    pub fn increment(&self) -> usize {
        let next = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.send_replace(next);
        next
    }

    /// Release one in-flight operation and return the new count.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero. An unmatched decrement is a bug
    /// in the caller and would otherwise corrupt every later drain.
    pub fn decrement(&self) -> usize {
        let prev = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let next = match prev {
            Ok(prev) => prev - 1,
            Err(_) => panic!("quiescence latch decremented below zero"),
        };
        self.latest.send_replace(next);
        next
    }

    /// The current count.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until the count is observed at exactly zero.
    ///
    /// Returns immediately if the count is zero right now. The count may rise
    /// and fall any number of times before settling.
    pub async fn wait_zero(&self) {
        // Subscribe before the first check so a change between the check and
        // the await still marks the receiver as changed.
        let mut rx = self.latest.subscribe();
        loop {
            if self.count() == 0 {
                return;
            }
            // The sender lives in `self`, so this cannot fail while we borrow it.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn increment_and_decrement_report_new_count() {
        let latch = QuiescenceLatch::new();
        assert_eq!(latch.increment(), 1);
        assert_eq!(latch.increment(), 2);
        assert_eq!(latch.decrement(), 1);
        assert_eq!(latch.count(), 1);
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn decrement_below_zero_panics() {
        let latch = QuiescenceLatch::new();
        latch.decrement();
    }

    #[tokio::test]
    async fn wait_zero_returns_immediately_when_idle() {
        let latch = QuiescenceLatch::new();
        tokio::time::timeout(Duration::from_millis(100), latch.wait_zero())
            .await
            .expect("idle latch should not block");
    }

    #[tokio::test]
    async fn wait_zero_blocks_until_last_release() {
        let latch = Arc::new(QuiescenceLatch::new());
        latch.increment();
        latch.increment();

        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait_zero().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        latch.decrement();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "one operation is still in flight");

        latch.decrement();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake at zero")
            .expect("waiter task should not panic");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_zero_survives_concurrent_churn() {
        let latch = Arc::new(QuiescenceLatch::new());
        // Hold the count above zero while workers churn.
        latch.increment();

        let mut workers = Vec::new();
        for _ in 0..8 {
            let latch = Arc::clone(&latch);
            workers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    latch.increment();
                    tokio::task::yield_now().await;
                    latch.decrement();
                }
            }));
        }

        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait_zero().await })
        };

        for worker in workers {
            worker.await.expect("worker should not panic");
        }
        latch.decrement();

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should observe the final zero")
            .expect("waiter task should not panic");
        assert_eq!(latch.count(), 0);
    }
}

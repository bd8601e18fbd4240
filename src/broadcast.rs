//! Multicast output channels for model updates and signals.
//!
//! Every subscriber owns an unbounded [`mpsc`] buffer, so a slow consumer
//! never loses an emission and never slows the writers down. The volume is
//! UI-scale, which makes the unbounded buffer acceptable.
//!
//! A [`Broadcaster`] closes exactly once. Closing drops every sender, so each
//! [`Subscription`] yields whatever is still buffered and then ends.

use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// One-to-many channel with per-subscriber ordered buffers.
#[derive(Debug)]
pub struct Broadcaster<T> {
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T> {
    /// Create an open broadcaster with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    // A panic while holding the lock cannot leave `Inner` half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to every emission from now on.
    ///
    /// After [`close`](Broadcaster::close) the returned subscription is
    /// already ended.
    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribe_with(Vec::new)
    }

    /// Subscribe with a seed that is delivered before any live emission.
    ///
    /// `seed` runs while the subscriber list is locked, so no emission can
    /// slip between the seed and the first live value. It must not call back
    /// into this broadcaster.
    pub fn subscribe_with<I, F>(&self, seed: F) -> Subscription<T>
    where
        F: FnOnce() -> I,
        I: IntoIterator<Item = T>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.closed {
            for value in seed() {
                // The receiver is alive in this scope.
                let _ = tx.send(value);
            }
            inner.subscribers.push(tx);
        }
        Subscription::new(rx)
    }

    /// Deliver `value` to every live subscriber.
    ///
    /// Returns how many subscribers received it. Subscribers whose receiver
    /// was dropped are pruned. After close this is a no-op returning 0.
    pub fn emit(&self, value: T) -> usize
    where
        T: Clone,
    {
        let mut inner = self.lock();
        if inner.closed {
            return 0;
        }
        inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        inner.subscribers.len()
    }

    /// Close permanently. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        inner.subscribers.clear();
        true
    }

    /// Whether [`close`](Broadcaster::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of registered subscribers, including ones dropped since the
    /// last emission.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Receiving end of a [`Broadcaster`].
///
/// Implements [`Stream`]; the stream ends once the broadcaster closes and
/// the buffer is drained.
#[derive(Debug)]
pub struct Subscription<T> {
    inner: UnboundedReceiverStream<T>,
}

impl<T> Subscription<T> {
    fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Wait for the next value; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.next().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Stream of committed model updates.
pub type Updates<M> = Subscription<M>;

/// Stream of ephemeral signals.
pub type Signals<S> = Subscription<S>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_every_value_in_order() {
        let hub = Broadcaster::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        for n in 1..=3 {
            assert_eq!(hub.emit(n), 2);
        }
        hub.close();

        let a_values: Vec<i32> = (&mut a).collect().await;
        let b_values: Vec<i32> = (&mut b).collect().await;
        assert_eq!(a_values, vec![1, 2, 3]);
        assert_eq!(b_values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_values() {
        let hub = Broadcaster::new();
        hub.emit("early");
        let mut sub = hub.subscribe();
        hub.emit("late");
        assert_eq!(sub.recv().await, Some("late"));
    }

    #[tokio::test]
    async fn seed_precedes_live_values() {
        let hub = Broadcaster::new();
        let mut sub = hub.subscribe_with(|| vec![10, 20]);
        hub.emit(30);
        hub.close();
        let values: Vec<i32> = (&mut sub).collect().await;
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let hub = Broadcaster::new();
        let mut sub = hub.subscribe();
        hub.emit(1);

        assert!(hub.close());
        assert!(!hub.close(), "second close reports no effect");
        assert_eq!(hub.emit(2), 0);

        // Buffered values survive the close; then the stream ends.
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);

        let mut after = hub.subscribe_with(|| vec![99]);
        assert_eq!(after.recv().await, None, "subscriptions after close are ended");
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = Broadcaster::new();
        let keep = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(hub.emit(()), 1);
        assert_eq!(hub.subscriber_count(), 1);
        drop(keep);
    }
}

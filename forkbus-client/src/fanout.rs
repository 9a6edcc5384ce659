//! Multi-subscriber delivery of cloned values.

use crate::stream::EventStream;
use tokio::sync::mpsc;

/// Delivers every sent value to every live subscriber.
///
/// Subscribers attached later only see later values unless they are handed
/// a backlog at attach time. Owners that need replay-then-tail semantics
/// hold their own lock around the backlog and the `subscribe_with` call.
#[derive(Debug)]
pub struct Fanout<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

impl<T> Default for Fanout<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            closed: false,
        }
    }
}

impl<T: Clone> Fanout<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber.
    pub fn subscribe(&mut self) -> EventStream<T> {
        self.subscribe_with(std::iter::empty())
    }

    /// Attach a subscriber that first receives `backlog`.
    ///
    /// After [`close`](Self::close) the stream yields the backlog and ends.
    pub fn subscribe_with(&mut self, backlog: impl IntoIterator<Item = T>) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        for value in backlog {
            // The receiver is alive right here.
            let _ = tx.send(value);
        }
        if !self.closed {
            self.prune();
            self.subscribers.push(tx);
        }
        EventStream::new(rx)
    }

    /// Forget subscribers whose stream was dropped.
    ///
    /// Returns the number still attached.
    pub fn prune(&mut self) -> usize {
        self.subscribers.retain(|tx| !tx.is_closed());
        self.subscribers.len()
    }

    /// Deliver `value` to every subscriber, pruning dropped ones.
    ///
    /// Returns the number of subscribers reached.
    pub fn send(&mut self, value: &T) -> usize {
        self.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        self.subscribers.len()
    }

    /// Complete every subscription and refuse new ones.
    pub fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_live_subscribers() {
        let mut fanout = Fanout::new();
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        assert_eq!(fanout.send(&1), 2);
        assert_eq!(a.next().await, Some(1));
        assert_eq!(b.next().await, Some(1));

        drop(b);
        assert_eq!(fanout.send(&2), 1);
        assert_eq!(a.next().await, Some(2));
    }

    #[tokio::test]
    async fn backlog_precedes_live_values() {
        let mut fanout = Fanout::new();
        let mut stream = fanout.subscribe_with(vec![1, 2]);
        fanout.send(&3);

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, Some(3));
    }

    #[tokio::test]
    async fn close_completes_streams() {
        let mut fanout = Fanout::new();
        let mut early = fanout.subscribe();
        fanout.close();

        assert!(early.next().await.is_none());
        let mut late = fanout.subscribe_with(vec!["last"]);
        assert_eq!(late.next().await, Some("last"));
        assert!(late.next().await.is_none());
        assert_eq!(fanout.send(&"ignored"), 0);
    }

    #[test]
    fn dropped_streams_are_pruned_without_sending() {
        let mut fanout: Fanout<u8> = Fanout::new();
        for _ in 0..100 {
            drop(fanout.subscribe());
        }
        // Each attach sweeps the ones dropped before it.
        assert_eq!(fanout.subscriber_count(), 1);
        assert_eq!(fanout.prune(), 0);

        let _live = fanout.subscribe();
        assert_eq!(fanout.prune(), 1);
    }
}

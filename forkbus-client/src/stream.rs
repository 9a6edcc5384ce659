//! Live streams handed out to observers.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// An async stream of values pushed by a producer.
///
/// Returned by the log, crash and metric observers. Use `next()` to
/// receive the next value, or drive it as a [`futures::Stream`].
///
/// # Example
///
/// ```rust,ignore
/// let mut logs = supervisor.logs();
///
/// while let Some(record) = logs.next().await {
///     println!("{record}");
/// }
/// ```
#[derive(Debug)]
pub struct EventStream<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> EventStream<T> {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<T>) -> Self {
        Self { receiver }
    }

    /// A stream that is already complete.
    #[must_use]
    pub fn closed() -> Self {
        let (_, receiver) = mpsc::unbounded_channel();
        Self { receiver }
    }

    /// Receive the next value.
    ///
    /// Returns `None` once the producer has completed the stream.
    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Receive the next value if one is already queued.
    pub fn try_next(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving. Values already queued can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

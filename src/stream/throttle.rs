//! Latest-wins stream throttling

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Extension trait to add throttling to any Stream
pub trait ThrottleExt: Stream {
    /// Emit at most once per `duration`.
    ///
    /// Items arriving within one interval collapse to the latest; a standings
    /// board only cares about the newest snapshot.
    fn throttle(self, duration: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, duration)
    }
}

impl<T: Stream> ThrottleExt for T {}

pin_project! {
    /// A stream combinator that throttles emission rate
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        pending: Option<S::Item>,
        finished: bool,
    }
}

impl<S: Stream> Throttle<S> {
    pub fn new(stream: S, duration: Duration) -> Self {
        let mut interval = interval(duration);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { stream, interval, pending: None, finished: false }
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.finished {
            return Poll::Ready(this.pending.take());
        }

        ready!(this.interval.poll_tick(cx));

        loop {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    *this.pending = Some(item);
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    return Poll::Ready(this.pending.take());
                }
                Poll::Pending => {
                    return match this.pending.take() {
                        Some(item) => Poll::Ready(Some(item)),
                        // Tick consumed with nothing to emit; wait for the inner stream.
                        None => Poll::Pending,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_to_latest() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut throttled = UnboundedReceiverStream::new(rx).throttle(Duration::from_millis(200));

        for n in 0..5 {
            tx.send(n).unwrap();
        }
        assert_eq!(throttled.next().await, Some(4));

        tx.send(5).unwrap();
        tx.send(6).unwrap();
        let start = tokio::time::Instant::now();
        assert_eq!(throttled.next().await, Some(6));
        assert!(start.elapsed() >= Duration::from_millis(200));

        drop(tx);
        assert_eq!(throttled.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_flushes_pending_item() {
        let items = futures::stream::iter(vec![1, 2, 3]);
        let collected: Vec<i32> = items.throttle(Duration::from_secs(1)).collect().await;
        assert_eq!(collected, vec![3]);
    }
}

//! Stream throttling utilities

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

use crate::types::TelemetryUpdate;

/// Items that can fold a newer item of the same kind into themselves.
pub trait Absorb {
    fn absorb(&mut self, newer: Self);
}

impl Absorb for Arc<TelemetryUpdate> {
    fn absorb(&mut self, newer: Self) {
        Arc::make_mut(self).absorb(Arc::unwrap_or_clone(newer));
    }
}

/// Extension trait to add throttling to any Stream
pub trait ThrottleExt: Stream {
    /// Throttle the stream to emit at most once per interval
    ///
    /// Items arriving within one interval are merged, so nothing a
    /// subscriber would have seen is lost, only batched.
    fn throttle(self, duration: Duration) -> Throttle<Self>
    where
        Self: Sized,
        Self::Item: Absorb,
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
    /// Create a new throttled stream
    pub fn new(stream: S, duration: Duration) -> Self {
        let mut interval = interval(duration);
        // Delay rather than burst after an idle period
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { stream, interval, pending: None, finished: false }
    }
}

impl<S> Stream for Throttle<S>
where
    S: Stream,
    S::Item: Absorb,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain everything available into the pending item
        while !*this.finished {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => match this.pending.as_mut() {
                    Some(pending) => pending.absorb(item),
                    None => *this.pending = Some(item),
                },
                Poll::Ready(None) => *this.finished = true,
                Poll::Pending => break,
            }
        }

        if this.pending.is_none() {
            return if *this.finished { Poll::Ready(None) } else { Poll::Pending };
        }
        if !*this.finished {
            ready!(this.interval.poll_tick(cx));
        }
        Poll::Ready(this.pending.take())
    }
}

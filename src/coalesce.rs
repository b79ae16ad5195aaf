//! Call coalescing
//!
//! Trailing-edge debounce keyed by an arbitrary key: every call re-arms the
//! key's timer, and only the last call of a burst runs its operation. A burst
//! that keeps re-arming still fires once `max_wait` has passed since its first
//! call, so a steady stream of laps cannot postpone a refresh forever.
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use kartwall::Coalescer;
//! use std::time::Duration;
//!
//! let coalescer: Coalescer<&str, u32> = Coalescer::new(Duration::from_millis(50));
//! let first = coalescer.debounce("kart-7", Duration::from_millis(10), || async { 1 });
//! let second = coalescer.debounce("kart-7", Duration::from_millis(10), || async { 2 });
//!
//! assert_eq!(first.await, None);
//! assert_eq!(second.await, Some(2));
//! assert_eq!(coalescer.result(&"kart-7"), Some(2));
//! # }
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Debounces async operations per key.
pub struct Coalescer<K, V> {
    inner: Arc<Mutex<State<K, V>>>,
    max_wait: Duration,
}

struct State<K, V> {
    next_generation: u64,
    pending: HashMap<K, Pending>,
    results: HashMap<K, V>,
}

struct Pending {
    generation: u64,
    first_armed: Instant,
    task: JoinHandle<()>,
}

impl<K, V> Clone for Coalescer<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), max_wait: self.max_wait }
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Coalescer whose bursts fire at most `max_wait` after their first call.
    pub fn new(max_wait: Duration) -> Self {
        let state = State { next_generation: 0, pending: HashMap::new(), results: HashMap::new() };
        Self { inner: Arc::new(Mutex::new(state)), max_wait }
    }

    /// Coalescer with the default ceiling of five times `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self::new(delay.saturating_mul(5))
    }

    /// Arm (or re-arm) the timer for `key`.
    ///
    /// The returned handle resolves to the operation's result once it runs,
    /// or to `None` if a later call or [`cancel`](Self::cancel) superseded it.
    /// Dropping the handle does not cancel the call.
    pub fn debounce<F, Fut>(&self, key: K, delay: Duration, operation: F) -> Debounced<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();

        let now = Instant::now();
        let first_armed = match state.pending.remove(&key) {
            Some(previous) => {
                previous.task.abort();
                trace!(generation = previous.generation, "Superseded pending call");
                previous.first_armed
            }
            None => now,
        };
        let deadline = (first_armed + self.max_wait).min(now + delay).max(now);

        state.next_generation += 1;
        let generation = state.next_generation;

        let inner = self.inner.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut state = inner.lock();
                match state.pending.get(&task_key) {
                    Some(pending) if pending.generation == generation => {
                        state.pending.remove(&task_key);
                    }
                    _ => return,
                }
            }
            let value = operation().await;
            inner.lock().results.insert(task_key, value.clone());
            let _ = tx.send(value);
        });

        state.pending.insert(key, Pending { generation, first_armed, task });
        Debounced { rx }
    }

    /// Abort the pending call for `key` without running it.
    pub fn cancel(&self, key: &K) -> bool {
        match self.inner.lock().pending.remove(key) {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    /// Result of the last completed call for `key`.
    pub fn result(&self, key: &K) -> Option<V> {
        self.inner.lock().results.get(key).cloned()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.inner.lock().pending.contains_key(key)
    }

    /// Abort every pending call and forget cached results.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        for (_, pending) in state.pending.drain() {
            pending.task.abort();
        }
        state.results.clear();
    }
}

/// Handle to a debounced call.
#[derive(Debug)]
pub struct Debounced<V> {
    rx: oneshot::Receiver<V>,
}

impl<V> Future for Debounced<V> {
    type Output = Option<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DELAY: Duration = Duration::from_millis(500);

    fn counting(calls: &Arc<AtomicU32>, value: u32) -> impl FnOnce() -> std::future::Ready<u32> + Send + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_runs_only_the_last_call() {
        let coalescer = Coalescer::with_delay(DELAY);
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for n in 1..=4 {
            handles.push(coalescer.debounce("k", DELAY, counting(&calls, n)));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let results = futures::future::join_all(handles).await;
        assert_eq!(results, vec![None, None, None, Some(4)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.result(&"k"), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay_of_silence() {
        let coalescer = Coalescer::with_delay(DELAY);
        let calls = Arc::new(AtomicU32::new(0));
        let handle = coalescer.debounce("k", DELAY, counting(&calls, 1));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(coalescer.is_pending(&"k"));

        assert_eq!(handle.await, Some(1));
        assert!(!coalescer.is_pending(&"k"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let coalescer = Coalescer::with_delay(DELAY);
        let a = coalescer.debounce("a", DELAY, || async { 1 });
        let b = coalescer.debounce("b", DELAY, || async { 2 });
        assert_eq!((a.await, b.await), (Some(1), Some(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_the_call() {
        let coalescer = Coalescer::with_delay(DELAY);
        let calls = Arc::new(AtomicU32::new(0));
        let handle = coalescer.debounce("k", DELAY, counting(&calls, 1));

        assert!(coalescer.cancel(&"k"));
        assert!(!coalescer.cancel(&"k"));
        assert_eq!(handle.await, None);

        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coalescer.result(&"k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_rearming_is_capped_by_max_wait() {
        let coalescer = Coalescer::new(Duration::from_millis(1_000));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let mut fired_at = None;
        for n in 0..20 {
            coalescer.debounce("k", DELAY, counting(&calls, n));
            tokio::time::sleep(Duration::from_millis(200)).await;
            if fired_at.is_none() && calls.load(Ordering::SeqCst) == 1 {
                fired_at = Some(start.elapsed());
            }
        }

        let fired_at = fired_at.expect("ceiling should force a flush");
        assert!(fired_at <= Duration::from_millis(1_200), "fired after {fired_at:?}");
        assert!(fired_at >= Duration::from_millis(1_000), "fired after {fired_at:?}");
    }
}

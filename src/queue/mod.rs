//! Asynchronous FIFO command queue
//!
//! A [`CommandQueue`] hands values out one at a time to whichever consumer is
//! waiting. Producers may insert plain values, nested lists of values, or
//! values that are not available yet ([`Value::Deferred`]); all of them are
//! flattened in left-to-right order before they become visible.

mod value;

pub use value::Value;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Queue insertion errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// A deferred value failed before it could be inserted.
    ///
    /// Only the insertion that was awaiting it is abandoned; values already
    /// delivered by that call stay in the queue.
    #[error("deferred value failed: {0}")]
    Deferred(String),
}

/// A value as handed out, stamped with the queue epoch it was taken in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub epoch: u64,
    pub value: T,
}

struct State<T> {
    /// Values nobody has asked for yet
    backlog: VecDeque<T>,
    /// Consumers waiting for a value, earliest first
    waiters: VecDeque<oneshot::Sender<Entry<T>>>,
    closed: bool,
    /// Bumped whenever the backlog is discarded
    epoch: u64,
}

/// Generic async FIFO with waiter hand-off
pub struct CommandQueue<T> {
    state: Mutex<State<T>>,
    /// Serializes `add`/`push` calls so they become visible in issue order
    insertion: tokio::sync::Mutex<()>,
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CommandQueue<T> {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                backlog: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
                epoch: 0,
            }),
            insertion: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A poisoned queue still holds consistent VecDeques.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert values, handing each one to the longest-waiting consumer if
    /// there is one, otherwise appending it to the backlog.
    pub async fn add<I>(&self, values: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = Value<T>>,
    {
        let _order = self.insertion.lock().await;
        flatten(values, |value| self.deliver(value)).await
    }

    /// Insert values at the back of the backlog without resolving waiters.
    pub async fn push<I>(&self, values: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = Value<T>>,
    {
        let _order = self.insertion.lock().await;
        flatten(values, |value| self.lock().backlog.push_back(value)).await
    }

    /// Put a value back at the front of the backlog.
    pub fn unshift(&self, value: T) {
        self.lock().backlog.push_front(value);
    }

    /// Retrieve the next value.
    ///
    /// The waiter is registered when `next` is called, not when the returned
    /// future is first polled, so waiters are served in call order.
    pub fn next(&self) -> Next<T> {
        Next {
            entry: self.next_entry(),
        }
    }

    /// Like [`next`](Self::next), but also reports the epoch the value was
    /// taken in. Comparing it with [`epoch`](Self::epoch) later tells
    /// whether the queue has been cleared since.
    pub fn next_entry(&self) -> NextEntry<T> {
        let mut state = self.lock();
        if let Some(value) = state.backlog.pop_front() {
            let epoch = state.epoch;
            NextEntry::ready(Some(Entry { epoch, value }))
        } else if state.closed {
            NextEntry::ready(None)
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            NextEntry {
                inner: NextInner::Waiting(rx),
            }
        }
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Mark the queue exhausted. Pending waiters resolve to `None`; values
    /// already in the backlog stay retrievable.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
    }

    /// Discard the backlog and start a new epoch, returning how many values
    /// were dropped
    pub fn clear(&self) -> usize {
        self.reset(std::iter::empty())
    }

    /// Discard the backlog, start a new epoch and insert `values` in one
    /// step. Nothing added before the reset can end up behind or between
    /// `values`.
    ///
    /// Unlike [`add`](Self::add) this does not wait for in-flight
    /// insertions, so a stuck deferred value cannot hold it up.
    pub fn reset<I>(&self, values: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.lock();
        state.epoch += 1;
        let dropped = state.backlog.len();
        state.backlog.clear();
        for value in values {
            deliver_locked(&mut state, value);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().backlog.is_empty()
    }

    /// Number of consumers currently waiting
    pub fn waiting(&self) -> usize {
        let mut state = self.lock();
        state.waiters.retain(|tx| !tx.is_closed());
        state.waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn deliver(&self, value: T) {
        deliver_locked(&mut self.lock(), value);
    }
}

fn deliver_locked<T>(state: &mut State<T>, mut value: T) {
    let epoch = state.epoch;
    while let Some(waiter) = state.waiters.pop_front() {
        match waiter.send(Entry { epoch, value }) {
            Ok(()) => return,
            // The consumer gave up; try the next one.
            Err(returned) => value = returned.value,
        }
    }
    state.backlog.push_back(value);
}

/// Walk values left to right, resolving nested lists and deferred values
async fn flatten<T, I, F>(values: I, mut sink: F) -> Result<(), QueueError>
where
    I: IntoIterator<Item = Value<T>>,
    F: FnMut(T),
{
    let mut stack: Vec<Value<T>> = values.into_iter().collect();
    stack.reverse();

    while let Some(value) = stack.pop() {
        match value {
            Value::One(value) => sink(value),
            Value::Many(values) => stack.extend(values.into_iter().rev()),
            Value::Deferred(pending) => stack.push(pending.await?),
        }
    }

    Ok(())
}

enum NextInner<T> {
    Ready(Option<Entry<T>>),
    Waiting(oneshot::Receiver<Entry<T>>),
    Done,
}

/// Future returned by [`CommandQueue::next_entry`]
pub struct NextEntry<T> {
    inner: NextInner<T>,
}

impl<T> NextEntry<T> {
    fn ready(entry: Option<Entry<T>>) -> Self {
        Self {
            inner: NextInner::Ready(entry),
        }
    }

    /// Whether the value was available without waiting
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, NextInner::Ready(_))
    }
}

// `T` is only ever moved out, never pinned.
impl<T> Unpin for NextEntry<T> {}

impl<T> Future for NextEntry<T> {
    type Output = Option<Entry<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match &mut this.inner {
            NextInner::Ready(_) => match std::mem::replace(&mut this.inner, NextInner::Done) {
                NextInner::Ready(entry) => Poll::Ready(entry),
                _ => Poll::Ready(None),
            },
            NextInner::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(result) => {
                    this.inner = NextInner::Done;
                    Poll::Ready(result.ok())
                }
                Poll::Pending => Poll::Pending,
            },
            NextInner::Done => Poll::Ready(None),
        }
    }
}

/// Future returned by [`CommandQueue::next`]. Resolves to `None` once the
/// queue is closed and drained.
pub struct Next<T> {
    entry: NextEntry<T>,
}

impl<T> Next<T> {
    /// Whether the value was available without waiting
    pub fn is_ready(&self) -> bool {
        self.entry.is_ready()
    }
}

impl<T> Unpin for Next<T> {}

impl<T> Future for Next<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.entry)
            .poll(cx)
            .map(|entry| entry.map(|e| e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backlog_is_fifo() {
        let queue = CommandQueue::new();
        queue.add([Value::One("a")]).await.unwrap();
        queue.add([Value::One("b")]).await.unwrap();

        assert_eq!(queue.next().await, Some("a"));
        assert_eq!(queue.next().await, Some("b"));
    }

    #[tokio::test]
    async fn test_waiters_served_in_call_order() {
        let queue = CommandQueue::new();
        let first = queue.next();
        let second = queue.next();
        assert!(!first.is_ready());

        queue.add([Value::One(1), Value::One(2)]).await.unwrap();

        assert_eq!(second.await, Some(2));
        assert_eq!(first.await, Some(1));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_lose_value() {
        let queue = CommandQueue::new();
        drop(queue.next());

        queue.add([Value::One("kept")]).await.unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some("kept"));
    }

    #[tokio::test]
    async fn test_push_skips_waiters() {
        let queue = CommandQueue::new();
        let waiting = queue.next();

        queue.push([Value::One("x")]).await.unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.waiting(), 1);
        drop(waiting);
        assert_eq!(queue.next().await, Some("x"));
    }

    #[tokio::test]
    async fn test_unshift_goes_to_front() {
        let queue = CommandQueue::new();
        queue.add([Value::One("second")]).await.unwrap();
        queue.unshift("first");

        assert_eq!(queue.next().await, Some("first"));
        assert_eq!(queue.next().await, Some("second"));
    }

    #[tokio::test]
    async fn test_close_keeps_backlog() {
        let queue = CommandQueue::new();
        queue.add([Value::One(7)]).await.unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.next().await, Some(7));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_close_releases_pending_waiters() {
        let queue: CommandQueue<u8> = CommandQueue::new();
        let pending = queue.next();
        queue.close();
        assert_eq!(pending.await, None);
    }

    #[tokio::test]
    async fn test_clear_reports_dropped() {
        let queue = CommandQueue::new();
        queue
            .add([Value::list(["a", "b", "c"])])
            .await
            .unwrap();
        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_reset_replaces_backlog_and_bumps_epoch() {
        let queue = CommandQueue::new();
        queue.add([Value::list(["stale", "older"])]).await.unwrap();
        let taken = queue.next_entry().await.unwrap();
        assert_eq!(taken.value, "stale");
        assert_eq!(taken.epoch, queue.epoch());

        assert_eq!(queue.reset(["init"]), 1);

        assert_ne!(taken.epoch, queue.epoch());
        let fresh = queue.next_entry().await.unwrap();
        assert_eq!(fresh.value, "init");
        assert_eq!(fresh.epoch, queue.epoch());
    }

    #[tokio::test]
    async fn test_reset_hands_values_to_waiters() {
        let queue = CommandQueue::new();
        let waiting = queue.next_entry();

        queue.reset(["init"]);

        let entry = waiting.await.unwrap();
        assert_eq!(entry.value, "init");
        assert_eq!(entry.epoch, 1);
    }
}

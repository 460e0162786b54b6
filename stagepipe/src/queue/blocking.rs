//! A condvar-backed blocking queue with pluggable ordering.

use crate::errors::{QueueError, Result};
use crate::feeder::Feeder;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Orders items in a priority queue. Items comparing `Less` are served first.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

enum Store<T> {
    Fifo(VecDeque<T>),
    Lifo(Vec<T>),
    Priority {
        items: VecDeque<T>,
        comparator: Comparator<T>,
    },
}

impl<T> Store<T> {
    fn push(&mut self, item: T) {
        match self {
            Self::Fifo(items) => items.push_back(item),
            Self::Lifo(items) => items.push(item),
            Self::Priority { items, comparator } => {
                // Equal items keep arrival order.
                let at = items.partition_point(|queued| comparator(queued, &item) != Ordering::Greater);
                items.insert(at, item);
            }
        }
    }

    fn pop(&mut self) -> Option<T> {
        match self {
            Self::Fifo(items) | Self::Priority { items, .. } => items.pop_front(),
            Self::Lifo(items) => items.pop(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Fifo(items) | Self::Priority { items, .. } => items.len(),
            Self::Lifo(items) => items.len(),
        }
    }
}

struct QueueState<T> {
    store: Store<T>,
    closed: bool,
    /// Set by `wake_all`, consumed by the next `poll` so a wake-up issued
    /// before the consumer starts waiting is not lost.
    interrupted: bool,
}

/// A thread-safe queue feeding one stage worker.
///
/// Producers append through [`Feeder::feed`] (or [`BlockingQueue::put`]), the
/// worker removes with a bounded [`BlockingQueue::poll`].
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
    fair: bool,
}

impl<T> BlockingQueue<T> {
    /// Creates an unbounded FIFO queue.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_store(Store::Fifo(VecDeque::new()), None, false)
    }

    /// Creates a bounded FIFO queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ZeroCapacity` if `capacity` is zero.
    pub fn bounded(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self::with_store(
            Store::Fifo(VecDeque::with_capacity(capacity)),
            Some(capacity),
            false,
        ))
    }

    pub(super) fn fifo(capacity: Option<usize>, fair: bool) -> Self {
        Self::with_store(Store::Fifo(VecDeque::new()), capacity, fair)
    }

    pub(super) fn lifo(capacity: Option<usize>, fair: bool) -> Self {
        Self::with_store(Store::Lifo(Vec::new()), capacity, fair)
    }

    pub(super) fn priority(comparator: Comparator<T>, capacity: Option<usize>, fair: bool) -> Self {
        Self::with_store(
            Store::Priority {
                items: VecDeque::new(),
                comparator,
            },
            capacity,
            fair,
        )
    }

    fn with_store(store: Store<T>, capacity: Option<usize>, fair: bool) -> Self {
        Self {
            state: Mutex::new(QueueState {
                store,
                closed: false,
                interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            fair,
        }
    }

    fn unlock(&self, guard: MutexGuard<'_, QueueState<T>>) {
        if self.fair {
            MutexGuard::unlock_fair(guard);
        } else {
            drop(guard);
        }
    }

    /// Appends an item, blocking while a bounded queue is full.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Closed` if the queue was closed before or while
    /// waiting for room.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            match self.capacity {
                Some(capacity) if state.store.len() >= capacity => {
                    self.not_full.wait(&mut state);
                }
                _ => break,
            }
        }
        state.store.push(item);
        self.not_empty.notify_one();
        self.unlock(state);
        Ok(())
    }

    /// Removes the next item, waiting at most `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or when woken by [`BlockingQueue::wake_all`]
    /// with nothing queued.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock();
        if state.store.len() == 0 && !state.interrupted {
            let _ = self.not_empty.wait_for(&mut state, timeout);
        }
        state.interrupted = false;
        let item = state.store.pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        self.unlock(state);
        item
    }

    /// Removes the next item without waiting.
    pub fn try_take(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.store.pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        self.unlock(state);
        item
    }

    /// Wakes a consumer blocked in `poll` so it can re-check its run status.
    pub fn wake_all(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.not_empty.notify_all();
    }

    /// Closes the queue: producers are rejected from now on.
    ///
    /// Items already queued stay available to `poll`/`try_take`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Returns true once the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity of a bounded queue.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl<T> fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("fair", &self.fair)
            .finish()
    }
}

impl<T: Send> Feeder<T> for BlockingQueue<T> {
    fn feed(&self, item: T) -> Result<()> {
        self.put(item)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = BlockingQueue::unbounded();
        for n in 1..=3 {
            queue.put(n).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_take(), Some(1));
        assert_eq!(queue.try_take(), Some(2));
        assert_eq!(queue.try_take(), Some(3));
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn test_lifo_order() {
        let queue = BlockingQueue::lifo(None, false);
        queue.put('a').unwrap();
        queue.put('b').unwrap();
        assert_eq!(queue.try_take(), Some('b'));
        assert_eq!(queue.try_take(), Some('a'));
    }

    #[test]
    fn test_priority_order_is_stable() {
        let comparator: Comparator<(u8, char)> =
            Arc::new(|a: &(u8, char), b: &(u8, char)| a.0.cmp(&b.0));
        let queue = BlockingQueue::priority(comparator, None, false);
        queue.put((2, 'c')).unwrap();
        queue.put((1, 'b')).unwrap();
        queue.put((2, 'd')).unwrap();
        queue.put((0, 'a')).unwrap();

        let order: String = std::iter::from_fn(|| queue.try_take()).map(|(_, c)| c).collect();
        assert_eq!(order, "abcd");
    }

    #[test]
    fn test_bounded_rejects_zero_capacity() {
        assert_eq!(BlockingQueue::<u8>::bounded(0).unwrap_err(), QueueError::ZeroCapacity);
    }

    #[test]
    fn test_poll_times_out() {
        let queue = BlockingQueue::<u8>::unbounded();
        let started = Instant::now();
        assert_eq!(queue.poll(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_poll_returns_item_put_by_other_thread() {
        let queue = Arc::new(BlockingQueue::unbounded());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.put(42).unwrap();
            })
        };

        assert_eq!(queue.poll(Duration::from_secs(5)), Some(42));
        producer.join().unwrap();
    }

    #[test]
    fn test_wake_before_poll_is_not_lost() {
        let queue = BlockingQueue::<u8>::unbounded();
        queue.wake_all();

        let started = Instant::now();
        assert_eq!(queue.poll(Duration::from_secs(5)), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_bounded_put_blocks_until_room() {
        let queue = Arc::new(BlockingQueue::bounded(1).unwrap());
        queue.put(1).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put(2))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_take(), Some(1));

        producer.join().unwrap().unwrap();
        assert_eq!(queue.try_take(), Some(2));
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let queue = Arc::new(BlockingQueue::bounded(1).unwrap());
        queue.put(1).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put(2))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(producer.join().unwrap(), Err(QueueError::Closed));
        assert!(queue.is_closed());
        assert_eq!(queue.try_take(), Some(1));
    }

    #[test]
    fn test_feed_on_closed_queue_fails() {
        let queue = BlockingQueue::unbounded();
        queue.close();
        assert!(queue.feed(1).is_err());
    }
}

//! Feeders: the write-only capability used to hand an item downstream.
//!
//! A stage never holds a reference to the next stage. It asks its context for
//! a feeder and writes into it; whether the item lands in another stage's
//! queue, a branch entry or a terminal sink is resolved by the pipeline.

use crate::errors::Result;
use parking_lot::Mutex;
use std::fmt;

/// Accepts one item for downstream delivery.
pub trait Feeder<T>: Send + Sync {
    /// Delivers `item` to whatever consumes next.
    ///
    /// May block when the target is a full bounded queue.
    fn feed(&self, item: T) -> Result<()>;
}

/// A feeder that discards every item. The default terminal feeder.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFeeder;

impl<T> Feeder<T> for NullFeeder {
    fn feed(&self, _item: T) -> Result<()> {
        Ok(())
    }
}

/// A feeder that keeps every item it receives, in arrival order.
pub struct CollectingFeeder<T> {
    items: Mutex<Vec<T>>,
}

impl<T> CollectingFeeder<T> {
    /// Creates an empty collecting feeder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of collected items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Removes and returns every collected item.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }
}

impl<T: Clone> CollectingFeeder<T> {
    /// Returns a copy of the collected items.
    #[must_use]
    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}

impl<T> Default for CollectingFeeder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CollectingFeeder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectingFeeder")
            .field("len", &self.len())
            .finish()
    }
}

impl<T: Send> Feeder<T> for CollectingFeeder<T> {
    fn feed(&self, item: T) -> Result<()> {
        self.items.lock().push(item);
        Ok(())
    }
}

/// Adapts a closure into a feeder.
pub struct FnFeeder<F> {
    func: F,
}

impl<F> FnFeeder<F> {
    /// Wraps `func`.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnFeeder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFeeder").finish_non_exhaustive()
    }
}

impl<T, F> Feeder<T> for FnFeeder<F>
where
    F: Fn(T) -> Result<()> + Send + Sync,
{
    fn feed(&self, item: T) -> Result<()> {
        (self.func)(item)
    }
}

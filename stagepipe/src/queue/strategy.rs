//! Queue construction strategies.

use super::{BlockingQueue, Comparator};
use crate::errors::QueueError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// The order in which a queue hands items to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// First in, first out.
    #[default]
    Fifo,
    /// Last in, first out.
    Lifo,
    /// Ordered by a comparator; smallest first, ties in arrival order.
    Priority,
}

/// Declarative queue policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Item ordering.
    #[serde(default)]
    pub ordering: QueueOrdering,
    /// Maximum number of queued items; `None` is unbounded.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Whether lock hand-off between producers and the worker is fair.
    #[serde(default)]
    pub fair: bool,
}

impl QueueConfig {
    /// Creates an unbounded FIFO configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bounded FIFO configuration.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Sets the ordering.
    #[must_use]
    pub fn with_ordering(mut self, ordering: QueueOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Sets fairness.
    #[must_use]
    pub fn with_fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }
}

/// Produces the queue a driver services.
pub trait QueueFactory<T>: Send + Sync {
    /// Creates a new, independent queue.
    fn create_queue(&self) -> Result<BlockingQueue<T>, QueueError>;
}

type InitialContents<T> = Arc<dyn Fn() -> Vec<T> + Send + Sync>;

/// The stock queue factory: a [`QueueConfig`] plus the parts of a policy that
/// depend on the item type.
pub struct QueueSpec<T> {
    config: QueueConfig,
    comparator: Option<Comparator<T>>,
    initial: Option<InitialContents<T>>,
}

impl<T> QueueSpec<T> {
    /// Creates a spec from a declarative configuration.
    #[must_use]
    pub fn from_config(config: QueueConfig) -> Self {
        Self {
            config,
            comparator: None,
            initial: None,
        }
    }

    /// Sets the comparator used by priority ordering.
    #[must_use]
    pub fn with_comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Some(Arc::new(comparator));
        self
    }

    /// Sets a supplier of items every new queue starts with.
    #[must_use]
    pub fn with_initial_contents<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> Vec<T> + Send + Sync + 'static,
    {
        self.initial = Some(Arc::new(supplier));
        self
    }

    /// Returns the declarative part of the spec.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl<T> Default for QueueSpec<T> {
    fn default() -> Self {
        Self::from_config(QueueConfig::default())
    }
}

impl<T> Clone for QueueSpec<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            comparator: self.comparator.clone(),
            initial: self.initial.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSpec")
            .field("config", &self.config)
            .field("has_comparator", &self.comparator.is_some())
            .field("has_initial_contents", &self.initial.is_some())
            .finish()
    }
}

impl<T: Send> QueueFactory<T> for QueueSpec<T> {
    fn create_queue(&self) -> Result<BlockingQueue<T>, QueueError> {
        let QueueConfig {
            ordering,
            capacity,
            fair,
        } = self.config;

        if capacity == Some(0) {
            return Err(QueueError::ZeroCapacity);
        }

        let initial = self.initial.as_ref().map(|supplier| supplier()).unwrap_or_default();
        if let Some(capacity) = capacity {
            if initial.len() > capacity {
                return Err(QueueError::CapacityExceeded {
                    capacity,
                    initial: initial.len(),
                });
            }
        }

        let queue = match ordering {
            QueueOrdering::Fifo => BlockingQueue::fifo(capacity, fair),
            QueueOrdering::Lifo => BlockingQueue::lifo(capacity, fair),
            QueueOrdering::Priority => {
                let comparator = self.comparator.clone().ok_or(QueueError::MissingComparator)?;
                BlockingQueue::priority(comparator, capacity, fair)
            }
        };

        for item in initial {
            queue.put(item)?;
        }
        Ok(queue)
    }
}

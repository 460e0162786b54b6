//! Stage queues and the strategies that build them.
//!
//! The engine consumes queues through [`QueueFactory`]; capacity, ordering and
//! fairness are policy supplied by the factory, not decided by the drivers.

mod blocking;
mod strategy;

pub use blocking::{BlockingQueue, Comparator};
pub use strategy::{QueueConfig, QueueFactory, QueueOrdering, QueueSpec};

//! Event listener trait and implementations.

use crate::core::{StageEvent, StageRef};
use parking_lot::RwLock;
use std::fmt;
use tracing::{debug, info, warn, Level};

/// Receives every event raised anywhere in the tree it is registered with.
pub trait StageEventListener: Send + Sync {
    /// Called synchronously on the raising thread.
    fn notify(&self, event: &StageEvent);
}

/// Adapts a closure into a listener.
pub struct FnListener<F> {
    func: F,
}

impl<F> FnListener<F>
where
    F: Fn(&StageEvent) + Send + Sync,
{
    /// Wraps `func`.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnListener").finish_non_exhaustive()
    }
}

impl<F> StageEventListener for FnListener<F>
where
    F: Fn(&StageEvent) + Send + Sync,
{
    fn notify(&self, event: &StageEvent) {
        (self.func)(event);
    }
}

/// A listener that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingListener {
    level: Level,
}

impl Default for LoggingListener {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingListener {
    /// Creates a new logging listener with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging listener.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl StageEventListener for LoggingListener {
    fn notify(&self, event: &StageEvent) {
        let stage = event.source.as_ref().map(|s| s.name.as_str()).unwrap_or("-");
        match self.level {
            Level::DEBUG | Level::TRACE => {
                debug!(
                    event_type = %event.event_type,
                    stage = %stage,
                    event_data = ?event.data,
                    "Event: {}", event.event_type
                );
            }
            Level::WARN | Level::ERROR => {
                warn!(
                    event_type = %event.event_type,
                    stage = %stage,
                    event_data = ?event.data,
                    "Event: {}", event.event_type
                );
            }
            _ => {
                info!(
                    event_type = %event.event_type,
                    stage = %stage,
                    event_data = ?event.data,
                    "Event: {}", event.event_type
                );
            }
        }
    }
}

/// A listener that keeps every event it is notified of.
#[derive(Debug, Default)]
pub struct CollectingListener {
    events: RwLock<Vec<StageEvent>>,
}

impl CollectingListener {
    /// Creates a new collecting listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<StageEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns events raised by the given stage.
    #[must_use]
    pub fn events_from(&self, stage: &StageRef) -> Vec<StageEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.is_from(stage))
            .cloned()
            .collect()
    }
}

impl StageEventListener for CollectingListener {
    fn notify(&self, event: &StageEvent) {
        self.events.write().push(event.clone());
    }
}

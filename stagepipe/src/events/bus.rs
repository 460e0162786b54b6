//! The tree-wide event bus.

use super::StageEventListener;
use crate::core::StageEvent;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Listener registry and raised-event log shared by one pipeline tree.
///
/// The bus is owned by the root node; every other node reaches it through its
/// parent chain, so there is exactly one registry per tree.
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn StageEventListener>>>,
    log: RwLock<VecDeque<StageEvent>>,
    log_limit: Option<usize>,
}

impl EventBus {
    /// Creates an empty bus keeping every raised event.
    #[must_use]
    pub fn new() -> Self {
        Self::with_log_limit(None)
    }

    /// Creates an empty bus keeping at most `limit` of the latest events.
    #[must_use]
    pub fn with_log_limit(limit: Option<usize>) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            log: RwLock::new(VecDeque::new()),
            log_limit: limit,
        }
    }

    /// Registers a listener for every subsequent event.
    pub fn register(&self, listener: Arc<dyn StageEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Logs `event` and notifies every registered listener.
    ///
    /// Listeners run outside the registry lock and may raise or register
    /// re-entrantly. A panicking listener is logged and skipped.
    pub fn raise(&self, event: &StageEvent) {
        let listeners = self.record(event);
        Self::deliver(&listeners, event);
    }

    /// Logs `event` and returns the listeners it must be delivered to.
    pub(crate) fn record(&self, event: &StageEvent) -> Vec<Arc<dyn StageEventListener>> {
        self.append(event.clone());
        self.listeners.read().clone()
    }

    pub(crate) fn deliver(listeners: &[Arc<dyn StageEventListener>], event: &StageEvent) {
        for listener in listeners {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.notify(event);
            })) {
                warn!(
                    event_type = %event.event_type,
                    panic = %crate::utils::panic_message(panic.as_ref()),
                    "Event listener panicked"
                );
            }
        }
    }

    fn append(&self, event: StageEvent) {
        let mut log = self.log.write();
        log.push_back(event);
        if let Some(limit) = self.log_limit {
            while log.len() > limit {
                log.pop_front();
            }
        }
    }

    /// Returns the raised-event log, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<StageEvent> {
        self.log.read().iter().cloned().collect()
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Moves every listener and logged event of `other` into this bus.
    ///
    /// Used when a subtree is attached below a new root.
    pub fn absorb(&self, other: &Self) {
        if std::ptr::eq(self, other) {
            return;
        }
        let listeners = std::mem::take(&mut *other.listeners.write());
        let events = std::mem::take(&mut *other.log.write());

        self.listeners.write().extend(listeners);
        for event in events {
            self.append(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("events", &self.log.read().len())
            .field("log_limit", &self.log_limit)
            .finish()
    }
}

//! Driver configuration.

use crate::queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bounded wait of an idle worker before it re-checks its status.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;

/// Configuration shared by the drivers a factory creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// How long an idle worker waits for an item before re-checking its status.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Whether per-item faults are logged and skipped instead of stopping the stage.
    #[serde(default)]
    pub fault_tolerant: bool,
    /// Prefix of worker thread names; the stage name is appended.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
    /// Policy of the queue each driver services.
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_thread_name_prefix() -> String {
    "stage".to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            fault_tolerant: false,
            thread_name_prefix: default_thread_name_prefix(),
            queue: QueueConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll timeout.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets fault tolerance.
    #[must_use]
    pub fn with_fault_tolerant(mut self, fault_tolerant: bool) -> Self {
        self.fault_tolerant = fault_tolerant;
        self
    }

    /// Sets the queue policy.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Gets the poll timeout as a Duration.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub(crate) fn thread_name(&self, stage: &str) -> String {
        format!("{}-{}", self.thread_name_prefix, stage)
    }
}

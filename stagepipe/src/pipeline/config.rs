//! Pipeline configuration.

use crate::driver::DriverConfig;
use serde::{Deserialize, Serialize};

/// Default bound of the raised-event log.
pub const DEFAULT_EVENT_LOG_LIMIT: usize = 10_000;

fn default_event_log_limit() -> Option<usize> {
    Some(DEFAULT_EVENT_LOG_LIMIT)
}

/// Configuration of one pipeline node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The pipeline name, used in logs and events.
    pub name: String,
    /// Settings of the drivers created for stages added without an explicit factory.
    #[serde(default)]
    pub driver: DriverConfig,
    /// Maximum number of events kept in the raised-event log. `None` keeps all.
    #[serde(default = "default_event_log_limit")]
    pub event_log_limit: Option<usize>,
}

impl PipelineConfig {
    /// Creates a configuration with default driver settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: DriverConfig::default(),
            event_log_limit: default_event_log_limit(),
        }
    }

    /// Sets the default driver settings.
    #[must_use]
    pub fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    /// Bounds the raised-event log.
    #[must_use]
    pub fn with_event_log_limit(mut self, limit: usize) -> Self {
        self.event_log_limit = Some(limit);
        self
    }

    /// Keeps every raised event.
    #[must_use]
    pub fn without_event_log_limit(mut self) -> Self {
        self.event_log_limit = None;
        self
    }

    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid configuration.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new("pipeline")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_json_uses_defaults() {
        let config = PipelineConfig::from_json(r#"{"name": "ingest"}"#).unwrap();
        assert_eq!(config, PipelineConfig::new("ingest"));
    }

    #[test]
    fn test_from_json_nested_driver() {
        let config = PipelineConfig::from_json(
            r#"{
                "name": "ingest",
                "event_log_limit": 100,
                "driver": {"poll_timeout_ms": 50, "fault_tolerant": true}
            }"#,
        )
        .unwrap();
        assert_eq!(config.event_log_limit, Some(100));
        assert_eq!(config.driver.poll_timeout_ms, 50);
        assert!(config.driver.fault_tolerant);
    }

    #[test]
    fn test_event_log_is_bounded_by_default() {
        let config = PipelineConfig::new("long-running");
        assert_eq!(config.event_log_limit, Some(DEFAULT_EVENT_LOG_LIMIT));
        assert_eq!(config.without_event_log_limit().event_log_limit, None);

        let unbounded =
            PipelineConfig::from_json(r#"{"name": "audit", "event_log_limit": null}"#).unwrap();
        assert_eq!(unbounded.event_log_limit, None);
    }

    #[test]
    fn test_missing_name_is_rejected() {
        assert!(PipelineConfig::from_json("{}").is_err());
    }
}

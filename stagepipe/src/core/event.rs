//! Stage event type broadcast over a pipeline tree.

use super::{ProcessingFailure, StageRef};
use crate::errors::DriverFault;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An immutable notification raised by a stage, a driver or a pipeline.
///
/// Events are delivered to every listener registered anywhere in the tree
/// the raising node belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// The event type (e.g., "stage.started", "stage.item_failed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// The stage that raised the event; `None` for pipeline-level events.
    #[serde(default)]
    pub source: Option<StageRef>,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl StageEvent {
    /// Creates a pipeline-level event with no source stage.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: None,
            timestamp: crate::utils::iso_timestamp(),
            data: HashMap::new(),
        }
    }

    /// Creates an event raised by a stage.
    #[must_use]
    pub fn from_stage(event_type: impl Into<String>, source: StageRef) -> Self {
        Self {
            source: Some(source),
            ..Self::new(event_type)
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns true if the event was raised by the given stage.
    #[must_use]
    pub fn is_from(&self, stage: &StageRef) -> bool {
        self.source.as_ref().is_some_and(|s| s.id == stage.id)
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn started(stage: &StageRef) -> Self {
        Self::from_stage("stage.started", stage.clone())
    }

    /// Creates a "stage.stopped" event.
    #[must_use]
    pub fn stopped(stage: &StageRef, processed: u64) -> Self {
        Self::from_stage("stage.stopped", stage.clone())
            .add_data("processed", serde_json::json!(processed))
    }

    /// Creates a "stage.item_failed" event for a tolerated or fatal item fault.
    #[must_use]
    pub fn item_failed(failure: &ProcessingFailure) -> Self {
        Self::from_stage("stage.item_failed", failure.stage.clone())
            .add_data("sequence", serde_json::json!(failure.sequence))
            .add_data("error", serde_json::json!(failure.error))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn failed(fault: &DriverFault) -> Self {
        Self::from_stage("stage.failed", fault.stage.clone())
            .add_data("phase", serde_json::json!(fault.phase))
            .add_data("error", serde_json::json!(fault.message))
    }

    /// Creates a "pipeline.started" event.
    #[must_use]
    pub fn pipeline_started(pipeline: &str) -> Self {
        Self::new("pipeline.started").add_data("pipeline", serde_json::json!(pipeline))
    }

    /// Creates a "pipeline.finished" event.
    #[must_use]
    pub fn pipeline_finished(pipeline: &str, success: bool) -> Self {
        Self::new("pipeline.finished")
            .add_data("pipeline", serde_json::json!(pipeline))
            .add_data("success", serde_json::json!(success))
    }
}

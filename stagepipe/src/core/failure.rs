//! Per-item processing failure records.

use super::StageRef;
use serde::{Deserialize, Serialize};

/// A recoverable fault raised by one `process` call.
///
/// Recording a failure never changes the stage's run status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFailure {
    /// The stage whose `process` call failed.
    pub stage: StageRef,
    /// Zero-based position of the item in the order the worker dequeued it.
    pub sequence: u64,
    /// The error message, including its cause chain.
    pub error: String,
    /// When the failure was recorded (ISO 8601).
    pub timestamp: String,
}

impl ProcessingFailure {
    /// Creates a failure record from a stage error.
    #[must_use]
    pub fn new(stage: StageRef, sequence: u64, error: &anyhow::Error) -> Self {
        Self {
            stage,
            sequence,
            error: format!("{error:#}"),
            timestamp: crate::utils::iso_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageId;

    #[test]
    fn test_failure_keeps_cause_chain() {
        let err = anyhow::anyhow!("socket closed").context("sending batch");
        let failure = ProcessingFailure::new(StageRef::new(StageId::new(), "upload"), 4, &err);

        assert_eq!(failure.sequence, 4);
        assert_eq!(failure.error, "sending batch: socket closed");
        assert!(failure.timestamp.contains('T'));
    }
}

//! Run status of a stage driver.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The run status recorded by a stage monitor.
///
/// Within one run cycle the status only moves forward:
/// `Stopped -> StartRequested -> Running -> StopRequested -> Stopped`, with
/// `Failed` reachable from `StartRequested` or `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// No worker is running. The only status a new run cycle may start from.
    #[default]
    Stopped,
    /// `start` was called; the worker has not reported in yet.
    StartRequested,
    /// The worker is servicing the queue.
    Running,
    /// `finish` was called; the worker drains and exits.
    StopRequested,
    /// The worker terminated on an unrecoverable fault.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::StartRequested => write!(f, "start_requested"),
            Self::Running => write!(f, "running"),
            Self::StopRequested => write!(f, "stop_requested"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns true while a worker may be alive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::StartRequested | Self::Running | Self::StopRequested)
    }

    /// Returns true if the status represents a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns true if `next` is a legal successor of this status.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Stopped, Self::StartRequested)
                | (Self::StartRequested, Self::Running | Self::StopRequested | Self::Failed)
                | (Self::Running, Self::StopRequested | Self::Failed)
                | (Self::StopRequested, Self::Stopped | Self::Failed)
        )
    }
}

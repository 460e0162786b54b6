//! Error types for the stagepipe engine.
//!
//! Errors fall into four groups: construction errors raised while a tree is
//! assembled, per-item processing faults (plain `anyhow::Error` values returned
//! by stage hooks), driver faults that terminate a worker, and lifecycle errors
//! raised by `start`/`finish`.

use crate::core::{StageRef, StageStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = StagepipeError> = std::result::Result<T, E>;

/// The main error type for stagepipe operations.
#[derive(Debug, Error)]
pub enum StagepipeError {
    /// An operation was attempted in a lifecycle state that does not allow it.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A stage was started while its driver was not stopped.
    #[error("Stage '{stage}' cannot be started while {status}")]
    IllegalThreadState {
        /// The stage name.
        stage: String,
        /// The status observed when the start was requested.
        status: StageStatus,
    },

    /// A stage or branch lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The pipeline topology is invalid.
    #[error("{0}")]
    Construction(#[from] ConstructionError),

    /// A stage worker terminated on an unrecoverable fault.
    #[error("{0}")]
    DriverFailed(#[from] DriverFault),

    /// A queue could not be created or no longer accepts items.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// A worker could not be shut down cleanly.
    #[error("Shutdown of stage '{stage}' failed: {reason}")]
    Shutdown {
        /// The stage name.
        stage: String,
        /// Why the shutdown failed.
        reason: String,
    },
}

impl StagepipeError {
    /// Returns true if this error was raised while assembling a pipeline.
    #[must_use]
    pub fn is_construction(&self) -> bool {
        matches!(self, Self::Construction(_))
    }

    /// Returns the driver fault carried by this error, if any.
    #[must_use]
    pub fn driver_fault(&self) -> Option<&DriverFault> {
        match self {
            Self::DriverFailed(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Error raised when a pipeline tree cannot be assembled.
#[derive(Debug, Error)]
pub enum ConstructionError {
    /// A branch with the same key is already registered.
    #[error("Pipeline '{pipeline}' already has a branch named '{key}'")]
    DuplicateBranch {
        /// The parent pipeline name.
        pipeline: String,
        /// The conflicting key.
        key: String,
    },

    /// Attaching the branch would make the tree cyclic.
    #[error("Branch '{key}' of pipeline '{pipeline}' would create a cycle")]
    BranchCycle {
        /// The parent pipeline name.
        pipeline: String,
        /// The offending key.
        key: String,
    },

    /// The child pipeline already belongs to another tree.
    #[error("Pipeline '{child}' is already attached to a parent and cannot become branch '{key}'")]
    AlreadyAttached {
        /// The child pipeline name.
        child: String,
        /// The requested key.
        key: String,
    },

    /// The stage instance already occupies a position in the tree.
    #[error("Stage '{stage}' is already bound and cannot be added to pipeline '{pipeline}'")]
    StageAlreadyBound {
        /// The stage name.
        stage: String,
        /// The pipeline that rejected it.
        pipeline: String,
    },

    /// No driver factory was available for a stage.
    #[error("No driver factory configured for stage '{stage}'")]
    MissingDriver {
        /// The stage name.
        stage: String,
    },

    /// A stage's `init` hook failed.
    #[error("Stage '{stage}' failed to initialize: {source}")]
    StageInit {
        /// The stage name.
        stage: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

/// Lifecycle phase in which a driver fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPhase {
    /// The worker could not be launched.
    Launch,
    /// The `preprocess` hook failed.
    Preprocess,
    /// A `process` call failed and the driver is not fault tolerant.
    Process,
    /// The `postprocess` hook failed.
    Postprocess,
}

impl std::fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch => write!(f, "launch"),
            Self::Preprocess => write!(f, "preprocess"),
            Self::Process => write!(f, "process"),
            Self::Postprocess => write!(f, "postprocess"),
        }
    }
}

/// A fatal fault that terminated a stage worker.
///
/// Faults are sticky: every `finish` on a failed stage reports the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Stage '{}' failed during {phase}: {message}", .stage.name)]
pub struct DriverFault {
    /// The failed stage.
    pub stage: StageRef,
    /// The phase in which the fault occurred.
    pub phase: FaultPhase,
    /// Human readable cause.
    pub message: String,
}

impl DriverFault {
    /// Creates a new driver fault.
    #[must_use]
    pub fn new(stage: StageRef, phase: FaultPhase, message: impl Into<String>) -> Self {
        Self {
            stage,
            phase,
            message: message.into(),
        }
    }
}

/// Errors produced by stage queues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A bounded queue was configured with zero capacity.
    #[error("Queue capacity must be greater than zero")]
    ZeroCapacity,

    /// The initial contents do not fit the declared capacity.
    #[error("Initial contents ({initial} items) exceed queue capacity {capacity}")]
    CapacityExceeded {
        /// Declared capacity.
        capacity: usize,
        /// Number of initial items.
        initial: usize,
    },

    /// Priority ordering was requested without a comparator.
    #[error("Priority ordering requires a comparator")]
    MissingComparator,

    /// The queue was closed because its consumer failed.
    #[error("Queue is closed")]
    Closed,
}

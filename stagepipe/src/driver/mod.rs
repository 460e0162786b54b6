//! Stage drivers: the workers that move items through stages.
//!
//! A driver owns the input of one stage and runs the stage's hooks on a
//! dedicated thread. Controllers use [`StageDriver::start`] and
//! [`StageDriver::finish`]; producers only ever see the driver's
//! [`Feeder`].

mod config;
mod monitor;
mod stage_queue;
mod thread;
mod worker;

pub use config::{DriverConfig, DEFAULT_POLL_TIMEOUT_MS};
pub use monitor::StageMonitor;
pub use stage_queue::{StageQueue, StageQueueFactory};
pub use thread::{ThreadDriverFactory, ThreadStageDriver};

use crate::context::StageContext;
use crate::core::{ProcessingFailure, StageRef, StageStatus};
use crate::errors::Result;
use crate::feeder::Feeder;
use crate::stages::Stage;
use std::fmt::Debug;
use std::sync::Arc;

/// Runs one stage on its own worker.
pub trait StageDriver<T>: Send + Sync + Debug {
    /// Returns the driven stage.
    fn stage(&self) -> &StageRef;

    /// Returns the feeder that enqueues into this driver's input.
    fn feeder(&self) -> Arc<dyn Feeder<T>>;

    /// Launches the worker.
    ///
    /// # Errors
    ///
    /// Returns `IllegalThreadState` unless the driver is stopped, or a
    /// `Launch` driver fault if the worker thread could not be spawned.
    fn start(&self) -> Result<()>;

    /// Requests a stop and blocks until the worker drained its input and exited.
    ///
    /// Finishing a stopped driver is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the recorded fault if the worker failed, and `IllegalState`
    /// when called from the driver's own worker.
    fn finish(&self) -> Result<()>;

    /// Returns the current run status.
    fn status(&self) -> StageStatus;

    /// Returns whether per-item faults are skipped.
    fn is_fault_tolerant(&self) -> bool;

    /// Sets whether per-item faults are skipped.
    fn set_fault_tolerant(&self, tolerant: bool);

    /// Returns the per-item faults of the current run cycle.
    fn processing_failures(&self) -> Vec<ProcessingFailure>;

    /// Returns the number of items waiting in the input.
    fn pending(&self) -> usize;
}

/// Creates the driver a stage is bound to when it joins a pipeline.
pub trait StageDriverFactory<T>: Send + Sync {
    /// Creates a stopped driver for `stage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver's input could not be created.
    fn create_driver(
        &self,
        stage: Arc<dyn Stage<T>>,
        ctx: StageContext<T>,
    ) -> Result<Arc<dyn StageDriver<T>>>;
}

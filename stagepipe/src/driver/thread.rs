//! Queue-plus-worker driver.

use super::worker::{WorkerCore, WorkerHandle};
use super::{DriverConfig, StageDriver, StageDriverFactory, StageMonitor};
use crate::context::StageContext;
use crate::core::{ProcessingFailure, StageRef, StageStatus};
use crate::errors::{DriverFault, Result};
use crate::feeder::Feeder;
use crate::queue::{BlockingQueue, QueueFactory, QueueSpec};
use crate::stages::Stage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct Shared<T> {
    core: WorkerCore<T>,
    queue: Arc<BlockingQueue<T>>,
    poll_timeout: Duration,
}

impl<T: Send + 'static> Shared<T> {
    fn work(&self) {
        self.core.run(
            || self.drive(),
            || self.queue.close(),
        );
    }

    /// Services the queue until a stop was requested and it is empty.
    ///
    /// The stop flag is read before polling, so an item enqueued before the
    /// stop request is always taken.
    fn drive(&self) -> Result<(), DriverFault> {
        self.core.preprocess()?;
        loop {
            let stopping = self.core.is_stopping();
            let next = if stopping {
                self.queue.try_take()
            } else {
                self.queue.poll(self.poll_timeout)
            };
            match next {
                Some(item) => self.core.process_item(item)?,
                None if stopping => break,
                None => {}
            }
        }
        self.core.postprocess()
    }
}

/// Runs one stage on a dedicated thread fed by a blocking queue.
///
/// The worker waits at most the poll timeout for an item before re-reading
/// its status, so a stop request is honored within one timeout even when no
/// wake-up arrives.
pub struct ThreadStageDriver<T> {
    shared: Arc<Shared<T>>,
    worker: WorkerHandle,
}

impl<T: Send + 'static> ThreadStageDriver<T> {
    /// Creates a driver for `stage` servicing `queue`.
    pub fn new(
        stage: Arc<dyn Stage<T>>,
        ctx: StageContext<T>,
        queue: BlockingQueue<T>,
        config: &DriverConfig,
    ) -> Self {
        let thread_name = config.thread_name(&ctx.stage().name);
        Self {
            shared: Arc::new(Shared {
                core: WorkerCore::new(stage, ctx, config.fault_tolerant),
                queue: Arc::new(queue),
                poll_timeout: config.poll_timeout(),
            }),
            worker: WorkerHandle::new(thread_name),
        }
    }

    /// Returns the stage monitor.
    #[must_use]
    pub fn monitor(&self) -> &StageMonitor {
        self.shared.core.monitor()
    }

    /// Returns the bounded wait of the idle worker.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        self.shared.poll_timeout
    }

    /// Returns the number of items processed without a fault.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.shared.core.processed()
    }
}

impl<T: Send + 'static> StageDriver<T> for ThreadStageDriver<T> {
    fn stage(&self) -> &StageRef {
        self.shared.core.stage_ref()
    }

    fn feeder(&self) -> Arc<dyn Feeder<T>> {
        self.shared.queue.clone()
    }

    fn start(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.worker.start(
            &self.shared.core,
            || {
                debug!(
                    stage = %self.stage().name,
                    thread = self.worker.thread_name(),
                    "Starting stage"
                );
            },
            move || shared.work(),
            || self.shared.queue.close(),
        )?;

        self.monitor()
            .await_status(|s| s != StageStatus::StartRequested, self.poll_timeout());
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.worker
            .finish(&self.shared.core, || self.shared.queue.wake_all())
    }

    fn status(&self) -> StageStatus {
        self.monitor().status()
    }

    fn is_fault_tolerant(&self) -> bool {
        self.shared.core.is_fault_tolerant()
    }

    fn set_fault_tolerant(&self, tolerant: bool) {
        self.shared.core.set_fault_tolerant(tolerant);
    }

    fn processing_failures(&self) -> Vec<ProcessingFailure> {
        self.monitor().processing_failures()
    }

    fn pending(&self) -> usize {
        self.shared.queue.len()
    }
}

impl<T> fmt::Debug for ThreadStageDriver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStageDriver")
            .field("thread", &self.worker.thread_name())
            .field("poll_timeout", &self.shared.poll_timeout)
            .finish_non_exhaustive()
    }
}

/// Creates a [`ThreadStageDriver`] per stage.
pub struct ThreadDriverFactory<T> {
    config: DriverConfig,
    queues: Arc<dyn QueueFactory<T>>,
}

impl<T: Send + 'static> ThreadDriverFactory<T> {
    /// Creates a factory with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&DriverConfig::default())
    }

    /// Creates a factory from a driver configuration.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            config: config.clone(),
            queues: Arc::new(QueueSpec::from_config(config.queue.clone())),
        }
    }

    /// Uses `factory` for the queues of created drivers.
    #[must_use]
    pub fn with_queue_factory(mut self, factory: impl QueueFactory<T> + 'static) -> Self {
        self.queues = Arc::new(factory);
        self
    }

    /// Sets the initial fault tolerance of created drivers.
    #[must_use]
    pub fn fault_tolerant(mut self, tolerant: bool) -> Self {
        self.config.fault_tolerant = tolerant;
        self
    }

    /// Sets the poll timeout of created drivers.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_poll_timeout(timeout);
        self
    }

    /// Returns the configuration applied to created drivers.
    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }
}

impl<T: Send + 'static> Default for ThreadDriverFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ThreadDriverFactory<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            queues: self.queues.clone(),
        }
    }
}

impl<T> fmt::Debug for ThreadDriverFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadDriverFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> StageDriverFactory<T> for ThreadDriverFactory<T> {
    fn create_driver(
        &self,
        stage: Arc<dyn Stage<T>>,
        ctx: StageContext<T>,
    ) -> Result<Arc<dyn StageDriver<T>>> {
        let queue = self.queues.create_queue()?;
        Ok(Arc::new(ThreadStageDriver::new(stage, ctx, queue, &self.config)))
    }
}

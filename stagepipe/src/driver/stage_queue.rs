//! Self-driving stage: a queue that owns the worker servicing it.

use super::worker::{WorkerCore, WorkerHandle};
use super::{DriverConfig, StageDriver, StageDriverFactory, StageMonitor};
use crate::context::StageContext;
use crate::core::{ProcessingFailure, StageRef, StageStatus};
use crate::errors::{DriverFault, QueueError, Result};
use crate::feeder::Feeder;
use crate::stages::Stage;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct Backlog<T> {
    items: VecDeque<T>,
    running: bool,
    closed: bool,
}

struct Inner<T> {
    core: WorkerCore<T>,
    backlog: Mutex<Backlog<T>>,
    ready: Condvar,
}

impl<T: Send + 'static> Inner<T> {
    fn work(&self) {
        self.core.run(|| self.drive(), || self.close());
    }

    /// Drains items while running, then whatever remains after the stop.
    fn drive(&self) -> Result<(), DriverFault> {
        self.core.preprocess()?;
        while let Some(item) = self.next() {
            self.core.process_item(item)?;
        }
        self.core.postprocess()
    }

    fn next(&self) -> Option<T> {
        let mut backlog = self.backlog.lock();
        while backlog.items.is_empty() && backlog.running {
            self.ready.wait(&mut backlog);
        }
        backlog.items.pop_front()
    }

    fn close(&self) {
        let mut backlog = self.backlog.lock();
        backlog.closed = true;
        backlog.running = false;
        backlog.items.clear();
    }

    fn set_running(&self, running: bool) {
        self.backlog.lock().running = running;
        self.ready.notify_all();
    }
}

impl<T: Send + 'static> Feeder<T> for Inner<T> {
    fn feed(&self, item: T) -> Result<()> {
        let mut backlog = self.backlog.lock();
        if backlog.closed {
            return Err(QueueError::Closed.into());
        }
        backlog.items.push_back(item);
        drop(backlog);
        self.ready.notify_one();
        Ok(())
    }
}

/// A stage driver whose worker blocks on its own queue without a timeout.
///
/// Enqueueing never blocks and always wakes the worker. Unlike
/// [`ThreadStageDriver`](super::ThreadStageDriver) there is no poll interval:
/// `finish` flips the running flag and wakes the worker directly.
pub struct StageQueue<T> {
    inner: Arc<Inner<T>>,
    worker: WorkerHandle,
}

impl<T: Send + 'static> StageQueue<T> {
    /// Creates a stopped, empty stage queue.
    pub fn new(stage: Arc<dyn Stage<T>>, ctx: StageContext<T>, config: &DriverConfig) -> Self {
        let thread_name = config.thread_name(&ctx.stage().name);
        Self {
            inner: Arc::new(Inner {
                core: WorkerCore::new(stage, ctx, config.fault_tolerant),
                backlog: Mutex::new(Backlog {
                    items: VecDeque::new(),
                    running: false,
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
            worker: WorkerHandle::new(thread_name),
        }
    }

    /// Appends `item` and wakes the worker.
    ///
    /// # Errors
    ///
    /// Returns `Queue(Closed)` once the worker failed.
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.inner.feed(item)
    }

    /// Returns the stage monitor.
    #[must_use]
    pub fn monitor(&self) -> &StageMonitor {
        self.inner.core.monitor()
    }

    /// Returns the number of items processed without a fault.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.inner.core.processed()
    }
}

impl<T: Send + 'static> StageDriver<T> for StageQueue<T> {
    fn stage(&self) -> &StageRef {
        self.inner.core.stage_ref()
    }

    fn feeder(&self) -> Arc<dyn Feeder<T>> {
        self.inner.clone()
    }

    fn start(&self) -> Result<()> {
        let inner = self.inner.clone();
        self.worker.start(
            &self.inner.core,
            || {
                debug!(
                    stage = %self.stage().name,
                    thread = self.worker.thread_name(),
                    "Starting stage queue"
                );
                self.inner.set_running(true);
            },
            move || inner.work(),
            || self.inner.close(),
        )
    }

    fn finish(&self) -> Result<()> {
        self.worker
            .finish(&self.inner.core, || self.inner.set_running(false))
    }

    fn status(&self) -> StageStatus {
        self.monitor().status()
    }

    fn is_fault_tolerant(&self) -> bool {
        self.inner.core.is_fault_tolerant()
    }

    fn set_fault_tolerant(&self, tolerant: bool) {
        self.inner.core.set_fault_tolerant(tolerant);
    }

    fn processing_failures(&self) -> Vec<ProcessingFailure> {
        self.monitor().processing_failures()
    }

    fn pending(&self) -> usize {
        self.inner.backlog.lock().items.len()
    }
}

impl<T> fmt::Debug for StageQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageQueue")
            .field("thread", &self.worker.thread_name())
            .finish_non_exhaustive()
    }
}

/// Creates a [`StageQueue`] per stage.
#[derive(Debug, Clone, Default)]
pub struct StageQueueFactory {
    config: DriverConfig,
}

impl StageQueueFactory {
    /// Creates a factory with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory from a driver configuration. Queue and poll settings
    /// do not apply to stage queues.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Sets the initial fault tolerance of created stage queues.
    #[must_use]
    pub fn fault_tolerant(mut self, tolerant: bool) -> Self {
        self.config.fault_tolerant = tolerant;
        self
    }
}

impl<T: Send + 'static> StageDriverFactory<T> for StageQueueFactory {
    fn create_driver(
        &self,
        stage: Arc<dyn Stage<T>>,
        ctx: StageContext<T>,
    ) -> Result<Arc<dyn StageDriver<T>>> {
        Ok(Arc::new(StageQueue::new(stage, ctx, &self.config)))
    }
}

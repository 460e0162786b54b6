//! Worker plumbing shared by the driver implementations.

use super::StageMonitor;
use crate::context::StageContext;
use crate::core::{ProcessingFailure, StageEvent, StageRef, StageStatus};
use crate::errors::{DriverFault, FaultPhase, Result, StagepipeError};
use crate::observability::stage_span;
use crate::stages::{Stage, StageResult};
use crate::utils::panic_message;
use parking_lot::Mutex;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, warn};

/// State of one stage as seen by its worker thread.
pub(crate) struct WorkerCore<T> {
    stage: Arc<dyn Stage<T>>,
    ctx: StageContext<T>,
    monitor: StageMonitor,
    fault_tolerant: AtomicBool,
    sequence: AtomicU64,
    processed: AtomicU64,
}

impl<T: Send + 'static> WorkerCore<T> {
    pub(crate) fn new(stage: Arc<dyn Stage<T>>, ctx: StageContext<T>, fault_tolerant: bool) -> Self {
        let monitor = StageMonitor::new(ctx.stage().clone());
        Self {
            stage,
            ctx,
            monitor,
            fault_tolerant: AtomicBool::new(fault_tolerant),
            sequence: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    pub(crate) fn stage_ref(&self) -> &StageRef {
        self.ctx.stage()
    }

    pub(crate) fn monitor(&self) -> &StageMonitor {
        &self.monitor
    }

    pub(crate) fn is_fault_tolerant(&self) -> bool {
        self.fault_tolerant.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fault_tolerant(&self, tolerant: bool) {
        self.fault_tolerant.store(tolerant, Ordering::SeqCst);
    }

    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.monitor.status() == StageStatus::StopRequested
    }

    /// Reports a fault that happened before the worker thread existed.
    pub(crate) fn launch_failed(&self, err: &io::Error) -> StagepipeError {
        let fault = DriverFault::new(self.stage_ref().clone(), FaultPhase::Launch, err.to_string());
        error!(stage = %self.stage_ref().name, error = %err, "Failed to launch stage worker");
        self.monitor.driver_failed(fault.clone());
        self.ctx.raise(StageEvent::failed(&fault));
        fault.into()
    }

    /// Runs one worker lifetime around `drive`.
    ///
    /// `release` runs on every exit path. On a fault `on_fault` runs before
    /// the monitor is marked failed, so feeders are already refusing items
    /// when a controller observes the failure.
    pub(crate) fn run<D, F>(&self, drive: D, on_fault: F)
    where
        D: FnOnce() -> Result<(), DriverFault>,
        F: FnOnce(),
    {
        let span = stage_span(self.stage_ref());
        let _entered = span.enter();

        self.monitor.driver_started();
        self.ctx.raise(StageEvent::started(self.stage_ref()));
        debug!("Stage worker started");

        let outcome = catch_unwind(AssertUnwindSafe(drive)).unwrap_or_else(|panic| {
            Err(DriverFault::new(
                self.stage_ref().clone(),
                FaultPhase::Process,
                format!("worker panicked: {}", panic_message(panic.as_ref())),
            ))
        });

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.stage.release())) {
            warn!(panic = %panic_message(panic.as_ref()), "Stage release panicked");
        }

        match outcome {
            Ok(()) => {
                let processed = self.processed();
                debug!(processed, "Stage worker drained and exiting");
                self.ctx.raise(StageEvent::stopped(self.stage_ref(), processed));
            }
            Err(fault) => {
                error!(phase = %fault.phase, error = %fault.message, "Stage worker failed");
                on_fault();
                self.monitor.driver_failed(fault.clone());
                self.ctx.raise(StageEvent::failed(&fault));
            }
        }
    }

    pub(crate) fn preprocess(&self) -> Result<(), DriverFault> {
        self.call_hook(FaultPhase::Preprocess, || self.stage.preprocess())
    }

    pub(crate) fn postprocess(&self) -> Result<(), DriverFault> {
        self.call_hook(FaultPhase::Postprocess, || self.stage.postprocess())
    }

    /// Processes one item. A tolerated fault is recorded and swallowed.
    pub(crate) fn process_item(&self, item: T) -> Result<(), DriverFault> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let result = catch_unwind(AssertUnwindSafe(|| self.stage.process(item)))
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("stage panicked: {}", panic_message(panic.as_ref()))));

        let Err(err) = result else {
            self.processed.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };

        let failure = ProcessingFailure::new(self.stage_ref().clone(), sequence, &err);
        self.monitor.processing_failed(failure.clone());
        self.ctx.raise(StageEvent::item_failed(&failure));

        if self.is_fault_tolerant() {
            warn!(sequence, error = %failure.error, "Skipping item after processing failure");
            Ok(())
        } else {
            Err(DriverFault::new(
                self.stage_ref().clone(),
                FaultPhase::Process,
                failure.error,
            ))
        }
    }

    fn call_hook<F>(&self, phase: FaultPhase, hook: F) -> Result<(), DriverFault>
    where
        F: FnOnce() -> StageResult,
    {
        catch_unwind(AssertUnwindSafe(hook))
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("stage panicked: {}", panic_message(panic.as_ref()))))
            .map_err(|err| DriverFault::new(self.stage_ref().clone(), phase, format!("{err:#}")))
    }
}

/// Join handle of a driver's worker thread.
///
/// `start` and `finish` serialize on the join handle: a stop request can
/// never slip in between the status check of a start and the handle of the
/// launched worker being stored.
pub(crate) struct WorkerHandle {
    thread_name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Arc<Mutex<Option<ThreadId>>>,
}

impl WorkerHandle {
    pub(crate) fn new(thread_name: String) -> Self {
        Self {
            thread_name,
            handle: Mutex::new(None),
            thread_id: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Requests a start and launches the worker running `body`.
    ///
    /// `prepare` runs once the start was accepted, before the worker exists.
    /// `on_fault` runs if the thread cannot be launched.
    pub(crate) fn start<T, P, B, F>(
        &self,
        core: &WorkerCore<T>,
        prepare: P,
        body: B,
        on_fault: F,
    ) -> Result<()>
    where
        T: Send + 'static,
        P: FnOnce(),
        B: FnOnce() + Send + 'static,
        F: FnOnce(),
    {
        let mut handle = self.handle.lock();
        core.monitor().start_requested()?;
        prepare();

        let thread_id = Arc::clone(&self.thread_id);
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                *thread_id.lock() = Some(thread::current().id());
                body();
            });
        match spawned {
            Ok(worker) => {
                *handle = Some(worker);
                Ok(())
            }
            Err(err) => {
                on_fault();
                Err(core.launch_failed(&err))
            }
        }
    }

    fn is_current_thread(&self) -> bool {
        *self.thread_id.lock() == Some(thread::current().id())
    }

    /// Stops the worker and blocks until it exited.
    ///
    /// `wake` must unblock a worker idling on its queue. Concurrent callers
    /// serialize on the join handle, so none returns before the worker exited.
    pub(crate) fn finish<T, W>(&self, core: &WorkerCore<T>, wake: W) -> Result<()>
    where
        T: Send + 'static,
        W: FnOnce(),
    {
        let stage = core.stage_ref();
        if self.is_current_thread() {
            return Err(StagepipeError::IllegalState(format!(
                "stage '{}' cannot be finished from its own worker",
                stage.name
            )));
        }

        let mut handle = self.handle.lock();
        if core.monitor().stop_requested() == StageStatus::Stopped {
            return Ok(());
        }
        wake();

        if let Some(handle) = handle.take() {
            if handle.join().is_err() {
                return Err(StagepipeError::Shutdown {
                    stage: stage.name.clone(),
                    reason: "worker thread panicked".to_string(),
                });
            }
        }
        *self.thread_id.lock() = None;

        if let Some(fault) = core.monitor().fault() {
            return Err(fault.into());
        }
        core.monitor().driver_stopped();
        debug!(stage = %stage.name, processed = core.processed(), "Stage stopped");
        Ok(())
    }
}

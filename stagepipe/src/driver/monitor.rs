//! The stage monitor: one authoritative run status per stage.

use crate::core::{ProcessingFailure, StageRef, StageStatus};
use crate::errors::{DriverFault, Result, StagepipeError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct MonitorState {
    status: StageStatus,
    failures: Vec<ProcessingFailure>,
    fault: Option<DriverFault>,
}

/// Synchronization point between a driver's controller and its worker.
///
/// Every mutation is a check-and-set under one mutex, so a controller
/// requesting a stop and a worker finishing concurrently cannot lose an update.
/// Status changes wake threads blocked in [`StageMonitor::await_status`].
pub struct StageMonitor {
    stage: StageRef,
    state: Mutex<MonitorState>,
    changed: Condvar,
}

impl StageMonitor {
    /// Creates a monitor in the `Stopped` state.
    #[must_use]
    pub fn new(stage: StageRef) -> Self {
        Self {
            stage,
            state: Mutex::new(MonitorState::default()),
            changed: Condvar::new(),
        }
    }

    /// Returns the monitored stage.
    #[must_use]
    pub fn stage(&self) -> &StageRef {
        &self.stage
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        self.state.lock().status
    }

    /// Controller: begins a run cycle.
    ///
    /// Clears the per-item failures of the previous cycle.
    ///
    /// # Errors
    ///
    /// Returns `IllegalThreadState` unless the status is `Stopped`.
    pub fn start_requested(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != StageStatus::Stopped {
            return Err(StagepipeError::IllegalThreadState {
                stage: self.stage.name.clone(),
                status: state.status,
            });
        }
        state.status = StageStatus::StartRequested;
        state.failures.clear();
        self.changed.notify_all();
        Ok(())
    }

    /// Worker: reports that it is servicing the queue.
    ///
    /// A stop requested before the worker reported in is kept.
    pub fn driver_started(&self) {
        let mut state = self.state.lock();
        if state.status == StageStatus::StartRequested {
            state.status = StageStatus::Running;
            self.changed.notify_all();
        }
    }

    /// Controller: asks the worker to drain and exit.
    ///
    /// Returns the status observed before the request. Idempotent: a stopped
    /// or failed monitor is left as it is.
    pub fn stop_requested(&self) -> StageStatus {
        let mut state = self.state.lock();
        let previous = state.status;
        if matches!(previous, StageStatus::StartRequested | StageStatus::Running) {
            state.status = StageStatus::StopRequested;
            self.changed.notify_all();
        }
        previous
    }

    /// Marks the run cycle as complete. A failed monitor stays failed.
    pub fn driver_stopped(&self) {
        let mut state = self.state.lock();
        if state.status != StageStatus::Failed {
            state.status = StageStatus::Stopped;
        }
        self.changed.notify_all();
    }

    /// Records a per-item fault. Does not change the status.
    pub fn processing_failed(&self, failure: ProcessingFailure) {
        self.state.lock().failures.push(failure);
    }

    /// Worker: reports an unrecoverable fault.
    pub fn driver_failed(&self, fault: DriverFault) {
        let mut state = self.state.lock();
        state.status = StageStatus::Failed;
        state.fault = Some(fault);
        self.changed.notify_all();
    }

    /// Returns the fatal fault, if the worker failed.
    #[must_use]
    pub fn fault(&self) -> Option<DriverFault> {
        self.state.lock().fault.clone()
    }

    /// Returns the per-item faults recorded in the current run cycle.
    #[must_use]
    pub fn processing_failures(&self) -> Vec<ProcessingFailure> {
        self.state.lock().failures.clone()
    }

    /// Returns the number of per-item faults recorded in the current run cycle.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.state.lock().failures.len()
    }

    /// Blocks until `accept` holds for the status or `timeout` elapses.
    ///
    /// Returns the last observed status.
    pub fn await_status<F>(&self, accept: F, timeout: Duration) -> StageStatus
    where
        F: Fn(StageStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !accept(state.status) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.status
    }
}

impl fmt::Debug for StageMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StageMonitor")
            .field("stage", &self.stage.name)
            .field("status", &state.status)
            .field("failures", &state.failures.len())
            .field("fault", &state.fault)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageId;
    use crate::errors::FaultPhase;
    use std::sync::Arc;
    use std::thread;

    fn monitor() -> StageMonitor {
        StageMonitor::new(StageRef::new(StageId::new(), "monitored"))
    }

    #[test]
    fn test_full_cycle() {
        let monitor = monitor();
        assert_eq!(monitor.status(), StageStatus::Stopped);

        monitor.start_requested().unwrap();
        assert_eq!(monitor.status(), StageStatus::StartRequested);

        monitor.driver_started();
        assert_eq!(monitor.status(), StageStatus::Running);

        assert_eq!(monitor.stop_requested(), StageStatus::Running);
        assert_eq!(monitor.status(), StageStatus::StopRequested);

        monitor.driver_stopped();
        assert_eq!(monitor.status(), StageStatus::Stopped);
    }

    #[test]
    fn test_start_requires_stopped() {
        let monitor = monitor();
        monitor.start_requested().unwrap();

        let err = monitor.start_requested().unwrap_err();
        assert!(matches!(
            err,
            StagepipeError::IllegalThreadState {
                status: StageStatus::StartRequested,
                ..
            }
        ));
    }

    #[test]
    fn test_stop_is_idempotent_when_stopped() {
        let monitor = monitor();
        assert_eq!(monitor.stop_requested(), StageStatus::Stopped);
        assert_eq!(monitor.status(), StageStatus::Stopped);
    }

    #[test]
    fn test_stop_before_worker_reports_in_is_kept() {
        let monitor = monitor();
        monitor.start_requested().unwrap();
        monitor.stop_requested();
        monitor.driver_started();
        assert_eq!(monitor.status(), StageStatus::StopRequested);
    }

    #[test]
    fn test_processing_failure_keeps_status() {
        let monitor = monitor();
        monitor.start_requested().unwrap();
        monitor.driver_started();

        let failure = ProcessingFailure::new(monitor.stage().clone(), 0, &anyhow::anyhow!("bad"));
        monitor.processing_failed(failure);

        assert_eq!(monitor.status(), StageStatus::Running);
        assert_eq!(monitor.failure_count(), 1);
    }

    #[test]
    fn test_failed_is_sticky() {
        let monitor = monitor();
        monitor.start_requested().unwrap();
        monitor.driver_started();
        monitor.driver_failed(DriverFault::new(monitor.stage().clone(), FaultPhase::Process, "boom"));

        assert_eq!(monitor.stop_requested(), StageStatus::Failed);
        monitor.driver_stopped();
        assert_eq!(monitor.status(), StageStatus::Failed);
        assert!(monitor.start_requested().is_err());
        assert_eq!(monitor.fault().map(|f| f.message), Some("boom".to_string()));
    }

    #[test]
    fn test_new_cycle_clears_failures() {
        let monitor = monitor();
        monitor.start_requested().unwrap();
        monitor.processing_failed(ProcessingFailure::new(
            monitor.stage().clone(),
            0,
            &anyhow::anyhow!("bad"),
        ));
        monitor.stop_requested();
        monitor.driver_stopped();

        monitor.start_requested().unwrap();
        assert_eq!(monitor.failure_count(), 0);
    }

    #[test]
    fn test_await_status_wakes_on_change() {
        let monitor = Arc::new(monitor());
        monitor.start_requested().unwrap();

        let worker = {
            let monitor = monitor.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                monitor.driver_started();
            })
        };

        let status = monitor.await_status(|s| s == StageStatus::Running, Duration::from_secs(5));
        assert_eq!(status, StageStatus::Running);
        worker.join().unwrap();
    }

    #[test]
    fn test_await_status_times_out() {
        let monitor = monitor();
        let status = monitor.await_status(|s| s == StageStatus::Running, Duration::from_millis(10));
        assert_eq!(status, StageStatus::Stopped);
    }
}

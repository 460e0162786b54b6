//! Testing utilities for stagepipe pipelines.
//!
//! This module provides:
//! - Instrumented stages that count hook calls and items
//! - Assertions over raised events
//! - A polling helper for asynchronous outcomes

mod assertions;
mod mocks;

pub use assertions::{assert_event_count, assert_raised_before, assert_stage_events};
pub use mocks::{CountingStage, FlakyStage, SlowStage};

use std::thread;
use std::time::{Duration, Instant};

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns the final value of `condition`.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

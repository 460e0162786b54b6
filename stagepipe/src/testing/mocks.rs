//! Instrumented stages for testing.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::context::StageContext;
use crate::stages::{ContextSlot, Stage, StageResult};

/// Counts every hook call a stage receives.
#[derive(Debug, Default)]
struct HookCounts {
    preprocess: AtomicUsize,
    postprocess: AtomicUsize,
    release: AtomicUsize,
    threads: Mutex<HashSet<ThreadId>>,
}

impl HookCounts {
    fn preprocessed(&self) {
        self.preprocess.fetch_add(1, Ordering::SeqCst);
    }

    fn postprocessed(&self) {
        self.postprocess.fetch_add(1, Ordering::SeqCst);
    }

    fn released(&self) {
        self.release.fetch_add(1, Ordering::SeqCst);
    }

    fn record_thread(&self) {
        self.threads.lock().insert(thread::current().id());
    }
}

/// Forwards downstream when enabled, using the context from `init`.
struct Forwarder<T> {
    enabled: bool,
    ctx: ContextSlot<T>,
}

impl<T: Send + 'static> Forwarder<T> {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ctx: ContextSlot::new(),
        }
    }

    fn forward(&self, item: T) -> StageResult {
        if self.enabled {
            self.ctx.get()?.feed_downstream(item)?;
        }
        Ok(())
    }
}

macro_rules! impl_hook_accessors {
    ($stage:ident) => {
        impl<T> $stage<T> {
            /// Returns how often `preprocess` ran.
            #[must_use]
            pub fn preprocess_calls(&self) -> usize {
                self.hooks.preprocess.load(Ordering::SeqCst)
            }

            /// Returns how often `postprocess` ran.
            #[must_use]
            pub fn postprocess_calls(&self) -> usize {
                self.hooks.postprocess.load(Ordering::SeqCst)
            }

            /// Returns how often `release` ran.
            #[must_use]
            pub fn release_calls(&self) -> usize {
                self.hooks.release.load(Ordering::SeqCst)
            }

            /// Returns the number of distinct threads that called `process`.
            #[must_use]
            pub fn worker_threads(&self) -> usize {
                self.hooks.threads.lock().len()
            }
        }

        impl<T> fmt::Debug for $stage<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($stage))
                    .field("name", &self.name)
                    .field("forwarding", &self.forwarder.enabled)
                    .finish_non_exhaustive()
            }
        }
    };
}

/// Counts items and optionally forwards them downstream.
pub struct CountingStage<T> {
    name: String,
    count: AtomicUsize,
    hooks: HookCounts,
    forwarder: Forwarder<T>,
}

impl<T: Send + 'static> CountingStage<T> {
    /// Creates a counting sink that keeps every item.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: AtomicUsize::new(0),
            hooks: HookCounts::default(),
            forwarder: Forwarder::new(false),
        }
    }

    /// Creates a counting stage that forwards each item downstream.
    #[must_use]
    pub fn forwarding(name: impl Into<String>) -> Self {
        Self {
            forwarder: Forwarder::new(true),
            ..Self::new(name)
        }
    }
}

impl<T> CountingStage<T> {
    /// Returns the number of items processed.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl_hook_accessors!(CountingStage);

impl<T: Send + 'static> Stage<T> for CountingStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StageContext<T>) -> StageResult {
        self.forwarder.ctx.set(ctx)
    }

    fn preprocess(&self) -> StageResult {
        self.hooks.preprocessed();
        Ok(())
    }

    fn process(&self, item: T) -> StageResult {
        self.hooks.record_thread();
        self.count.fetch_add(1, Ordering::SeqCst);
        self.forwarder.forward(item)
    }

    fn postprocess(&self) -> StageResult {
        self.hooks.postprocessed();
        Ok(())
    }

    fn release(&self) {
        self.hooks.released();
    }
}

/// Fails every n-th item it receives.
pub struct FlakyStage<T> {
    name: String,
    every: usize,
    seen: AtomicUsize,
    succeeded: AtomicUsize,
    hooks: HookCounts,
    forwarder: Forwarder<T>,
}

impl<T: Send + 'static> FlakyStage<T> {
    /// Creates a stage failing items `every`, `2 * every`, ... (1-based).
    ///
    /// `every == 1` fails every item; `every == 0` never fails.
    #[must_use]
    pub fn new(name: impl Into<String>, every: usize) -> Self {
        Self {
            name: name.into(),
            every,
            seen: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            hooks: HookCounts::default(),
            forwarder: Forwarder::new(false),
        }
    }

    /// Forwards each successful item downstream.
    #[must_use]
    pub fn forwarding(mut self) -> Self {
        self.forwarder.enabled = true;
        self
    }
}

impl<T> FlakyStage<T> {
    /// Returns the number of items processed without a fault.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Returns the number of items received.
    #[must_use]
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

impl_hook_accessors!(FlakyStage);

impl<T: Send + 'static> Stage<T> for FlakyStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StageContext<T>) -> StageResult {
        self.forwarder.ctx.set(ctx)
    }

    fn preprocess(&self) -> StageResult {
        self.hooks.preprocessed();
        Ok(())
    }

    fn process(&self, item: T) -> StageResult {
        self.hooks.record_thread();
        let nth = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.every > 0 && nth % self.every == 0 {
            anyhow::bail!("item {nth} rejected by {}", self.name);
        }
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.forwarder.forward(item)
    }

    fn postprocess(&self) -> StageResult {
        self.hooks.postprocessed();
        Ok(())
    }

    fn release(&self) {
        self.hooks.released();
    }
}

/// Sleeps for a fixed delay per item.
pub struct SlowStage<T> {
    name: String,
    delay: Duration,
    count: AtomicUsize,
    hooks: HookCounts,
    forwarder: Forwarder<T>,
}

impl<T: Send + 'static> SlowStage<T> {
    /// Creates a slow sink.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            count: AtomicUsize::new(0),
            hooks: HookCounts::default(),
            forwarder: Forwarder::new(false),
        }
    }

    /// Creates a slow stage with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }

    /// Forwards each item downstream after the delay.
    #[must_use]
    pub fn forwarding(mut self) -> Self {
        self.forwarder.enabled = true;
        self
    }
}

impl<T> SlowStage<T> {
    /// Returns the number of items processed.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl_hook_accessors!(SlowStage);

impl<T: Send + 'static> Stage<T> for SlowStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StageContext<T>) -> StageResult {
        self.forwarder.ctx.set(ctx)
    }

    fn preprocess(&self) -> StageResult {
        self.hooks.preprocessed();
        Ok(())
    }

    fn process(&self, item: T) -> StageResult {
        self.hooks.record_thread();
        thread::sleep(self.delay);
        self.count.fetch_add(1, Ordering::SeqCst);
        self.forwarder.forward(item)
    }

    fn postprocess(&self) -> StageResult {
        self.hooks.postprocessed();
        Ok(())
    }

    fn release(&self) {
        self.hooks.released();
    }
}

//! Stage trait and built-in stages.
//!
//! Stages are the units of work of a pipeline. A stage never pulls from a
//! queue itself: its driver calls `process` once per dequeued item, and the
//! stage forwards results through the feeders its context resolves.

use crate::context::StageContext;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::OnceLock;

/// Result type returned by stage hooks.
pub type StageResult = anyhow::Result<()>;

/// Trait for pipeline stages.
///
/// Every hook except `process` has a no-op default. Hooks take `&self`; a
/// stage keeps its own mutable state behind locks or atomics.
///
/// Call order for one run: `init` once when the stage joins a pipeline, then
/// per start/finish cycle `preprocess`, `process` for each item,
/// `postprocess` on normal exit, and `release` on every exit path.
pub trait Stage<T>: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Receives the context the stage uses to reach its feeders.
    fn init(&self, _ctx: &StageContext<T>) -> StageResult {
        Ok(())
    }

    /// Runs once on the worker before the first item.
    fn preprocess(&self) -> StageResult {
        Ok(())
    }

    /// Handles one item. An error is a per-item fault.
    fn process(&self, item: T) -> StageResult;

    /// Runs once after the queue was drained on a normal stop.
    fn postprocess(&self) -> StageResult {
        Ok(())
    }

    /// Releases resources. Runs on every worker exit, including failures.
    fn release(&self) {}
}

/// Remembers the context handed to `init`.
///
/// Stages that forward items embed one of these instead of re-implementing
/// context bookkeeping.
pub struct ContextSlot<T> {
    ctx: OnceLock<StageContext<T>>,
}

impl<T> ContextSlot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctx: OnceLock::new(),
        }
    }

    /// Stores the context.
    ///
    /// # Errors
    ///
    /// Fails if the slot already holds a context: a stage occupies exactly
    /// one pipeline position.
    pub fn set(&self, ctx: &StageContext<T>) -> anyhow::Result<()> {
        self.ctx.set(ctx.clone()).map_err(|rejected| {
            anyhow::anyhow!(
                "stage '{}' is already bound to a pipeline position",
                rejected.stage().name
            )
        })
    }

    /// Returns the stored context.
    ///
    /// # Errors
    ///
    /// Fails if the stage was never initialized by a pipeline.
    pub fn get(&self) -> anyhow::Result<&StageContext<T>> {
        self.ctx
            .get()
            .ok_or_else(|| anyhow::anyhow!("stage used before it was added to a pipeline"))
    }
}

impl<T> Default for ContextSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for ContextSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("initialized", &self.ctx.get().is_some())
            .finish()
    }
}

/// A closure-based stage. The closure receives each item and the stage context.
pub struct FnStage<T, F>
where
    F: Fn(T, &StageContext<T>) -> StageResult + Send + Sync,
{
    name: String,
    func: F,
    ctx: ContextSlot<T>,
    _item: PhantomData<fn(T)>,
}

impl<T, F> FnStage<T, F>
where
    F: Fn(T, &StageContext<T>) -> StageResult + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            ctx: ContextSlot::new(),
            _item: PhantomData,
        }
    }
}

impl<T, F> Debug for FnStage<T, F>
where
    F: Fn(T, &StageContext<T>) -> StageResult + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

impl<T, F> Stage<T> for FnStage<T, F>
where
    T: Send + 'static,
    F: Fn(T, &StageContext<T>) -> StageResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StageContext<T>) -> StageResult {
        self.ctx.set(ctx)
    }

    fn process(&self, item: T) -> StageResult {
        (self.func)(item, self.ctx.get()?)
    }
}

/// Forwards every item to the downstream feeder unchanged.
pub struct PassThroughStage<T> {
    name: String,
    ctx: ContextSlot<T>,
}

impl<T> PassThroughStage<T> {
    /// Creates a new pass-through stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ctx: ContextSlot::new(),
        }
    }
}

impl<T> Debug for PassThroughStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassThroughStage")
            .field("name", &self.name)
            .finish()
    }
}

impl<T: Send + 'static> Stage<T> for PassThroughStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StageContext<T>) -> StageResult {
        self.ctx.set(ctx)
    }

    fn process(&self, item: T) -> StageResult {
        self.ctx.get()?.feed_downstream(item)?;
        Ok(())
    }
}

/// Consumes and discards every item.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl<T: Send + 'static> Stage<T> for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, _item: T) -> StageResult {
        Ok(())
    }
}

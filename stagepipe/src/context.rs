//! The per-stage context.
//!
//! A [`StageContext`] is a stage's only handle on its surroundings. It holds a
//! weak link to the owning pipeline, so a stage never keeps its pipeline alive
//! and every operation on a context whose pipeline was dropped fails with
//! `IllegalState`.

use crate::core::{StageEvent, StageId, StageRef};
use crate::errors::{Result, StagepipeError};
use crate::events::StageEventListener;
use crate::feeder::Feeder;
use crate::pipeline::{Pipeline, PipelineInner};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Resolves feeders, environment values and event routing for one stage.
pub struct StageContext<T> {
    pipeline: Weak<PipelineInner<T>>,
    stage: StageRef,
}

impl<T> StageContext<T> {
    pub(crate) fn new(pipeline: Weak<PipelineInner<T>>, stage: StageRef) -> Self {
        Self { pipeline, stage }
    }

    /// Creates a context that belongs to no pipeline.
    ///
    /// Events raised through it are dropped and feeder lookups fail. Used to
    /// run a driver on its own.
    #[must_use]
    pub fn detached(stage_name: impl Into<String>) -> Self {
        Self::new(Weak::new(), StageRef::new(StageId::new(), stage_name))
    }

    /// Returns the stage this context belongs to.
    #[must_use]
    pub fn stage(&self) -> &StageRef {
        &self.stage
    }
}

impl<T: Send + 'static> StageContext<T> {
    /// Returns the owning pipeline.
    pub fn pipeline(&self) -> Result<Pipeline<T>> {
        self.pipeline
            .upgrade()
            .map(Pipeline::from_inner)
            .ok_or_else(|| {
                StagepipeError::IllegalState(format!(
                    "pipeline of stage '{}' is gone",
                    self.stage.name
                ))
            })
    }

    /// Returns the feeder for the stage after this one, or the pipeline's
    /// terminal feeder if this stage is last.
    pub fn downstream_feeder(&self) -> Result<Arc<dyn Feeder<T>>> {
        self.downstream_feeder_of(self.stage.id)
    }

    /// Returns the feeder for the stage after `stage` in the owning pipeline.
    pub fn downstream_feeder_of(&self, stage: StageId) -> Result<Arc<dyn Feeder<T>>> {
        self.pipeline()?.downstream_feeder(stage)
    }

    /// Returns the entry feeder of the branch registered under `key`.
    pub fn branch_feeder(&self, key: &str) -> Result<Arc<dyn Feeder<T>>> {
        self.pipeline()?.branch_feeder(key)
    }

    /// Hands `item` to the downstream feeder.
    pub fn feed_downstream(&self, item: T) -> Result<()> {
        self.downstream_feeder()?.feed(item)
    }

    /// Looks up an environment value, searching up the branch tree.
    #[must_use]
    pub fn env(&self, key: &str) -> Option<serde_json::Value> {
        self.pipeline().ok()?.env(key)
    }

    /// Raises `event` on the tree-wide bus.
    ///
    /// Events raised through a detached context are dropped.
    pub fn raise(&self, event: StageEvent) {
        match self.pipeline() {
            Ok(pipeline) => pipeline.raise(event),
            Err(_) => trace!(
                stage = %self.stage.name,
                event_type = %event.event_type,
                "Dropping event raised outside a pipeline"
            ),
        }
    }

    /// Registers `listener` on the tree-wide bus.
    pub fn register_listener(&self, listener: Arc<dyn StageEventListener>) -> Result<()> {
        self.pipeline()?.register_listener(listener);
        Ok(())
    }
}

impl<T> Clone for StageContext<T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            stage: self.stage.clone(),
        }
    }
}

impl<T> fmt::Debug for StageContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.stage)
            .field("attached", &(self.pipeline.strong_count() > 0))
            .finish()
    }
}

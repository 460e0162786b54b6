//! # Stagepipe
//!
//! A multi-stage, multi-threaded item processing engine.
//!
//! Stagepipe moves items through an ordered chain of stages. Each stage is
//! serviced by exactly one worker thread that owns the stage's input queue:
//!
//! - **Stages**: units of work with `init`/`preprocess`/`process`/`postprocess`/`release` hooks
//! - **Drivers**: a queue plus a dedicated worker per stage, with a bounded-wait poll loop
//! - **Graceful drain**: `finish` blocks until every queued item was processed
//! - **Branch trees**: named child pipelines reached through key-based feeder lookup
//! - **Events**: one tree-wide listener registry shared by every node
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stagepipe::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> stagepipe::errors::Result<()> {
//! let sink = Arc::new(CollectingFeeder::new());
//! let pipeline = PipelineBuilder::new("numbers")
//!     .stage(FnStage::new("double", |n: u64, ctx: &StageContext<u64>| {
//!         ctx.feed_downstream(n * 2)?;
//!         Ok(())
//!     }))
//!     .stage(PassThroughStage::new("forward"))
//!     .terminal(sink.clone())
//!     .build()?;
//!
//! pipeline.start()?;
//! for n in 0..10 {
//!     pipeline.enqueue(n)?;
//! }
//! pipeline.finish()?;
//! assert_eq!(sink.len(), 10);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod context;
pub mod core;
pub mod driver;
pub mod errors;
pub mod events;
pub mod feeder;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::StageContext;
    pub use crate::core::{ProcessingFailure, StageEvent, StageId, StageRef, StageStatus};
    pub use crate::driver::{
        DriverConfig, StageDriver, StageDriverFactory, StageMonitor, StageQueue,
        StageQueueFactory, ThreadDriverFactory, ThreadStageDriver,
    };
    pub use crate::errors::{
        ConstructionError, DriverFault, FaultPhase, QueueError, StagepipeError,
    };
    pub use crate::events::{
        CollectingListener, EventBus, FnListener, LoggingListener, StageEventListener,
    };
    pub use crate::feeder::{CollectingFeeder, Feeder, FnFeeder, NullFeeder};
    pub use crate::pipeline::{
        run_pipeline, Pipeline, PipelineBuilder, PipelineConfig, PipelineFactory,
    };
    pub use crate::queue::{BlockingQueue, QueueConfig, QueueFactory, QueueOrdering, QueueSpec};
    pub use crate::stages::{FnStage, NoOpStage, PassThroughStage, Stage, StageResult};
}

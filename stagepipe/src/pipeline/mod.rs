//! Pipeline trees.
//!
//! A [`Pipeline`] is an ordered chain of stages. Each stage feeds the next
//! one's driver; the last feeds the pipeline's terminal feeder. Pipelines can
//! carry named branches, forming a tree that is started and finished from
//! its root and shares one event bus.

mod builder;
mod config;
mod factory;
mod tree;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use config::{PipelineConfig, DEFAULT_EVENT_LOG_LIMIT};
pub use factory::{run_pipeline, PipelineFactory};
pub use tree::Pipeline;

pub(crate) use tree::PipelineInner;

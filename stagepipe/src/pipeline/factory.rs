//! The build contract between a pipeline loader and the engine.

use super::Pipeline;
use crate::errors::Result;
use tracing::info;

/// Produces a fully wired pipeline tree.
///
/// Implementations assemble stages, drivers and branches before returning;
/// the engine never parses a descriptor format itself.
pub trait PipelineFactory<T>: Send + Sync {
    /// Builds the tree.
    ///
    /// # Errors
    ///
    /// Returns a construction error if the tree cannot be assembled.
    fn create_pipeline(&self) -> Result<Pipeline<T>>;
}

impl<T, F> PipelineFactory<T> for F
where
    F: Fn() -> Result<Pipeline<T>> + Send + Sync,
{
    fn create_pipeline(&self) -> Result<Pipeline<T>> {
        self()
    }
}

/// Builds a tree, feeds it `items` and drains it.
///
/// Returns the finished pipeline so callers can inspect events and stages.
///
/// # Errors
///
/// Returns the construction error, the first failed `enqueue`, or the first
/// error reported by `finish`. The tree is always finished once started.
pub fn run_pipeline<T, F, I>(factory: &F, items: I) -> Result<Pipeline<T>>
where
    T: Send + 'static,
    F: PipelineFactory<T> + ?Sized,
    I: IntoIterator<Item = T>,
{
    let pipeline = factory.create_pipeline()?;
    pipeline.start()?;

    let mut enqueued = 0_u64;
    let fed = items.into_iter().try_for_each(|item| {
        enqueued += 1;
        pipeline.enqueue(item)
    });
    let finished = pipeline.finish();
    fed?;
    finished?;

    info!(pipeline = %pipeline.name(), enqueued, "Pipeline run complete");
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ConstructionError, StagepipeError};
    use crate::feeder::CollectingFeeder;
    use crate::pipeline::PipelineBuilder;
    use crate::stages::PassThroughStage;
    use std::sync::Arc;

    #[test]
    fn test_run_pipeline_drains_everything() {
        let sink = Arc::new(CollectingFeeder::new());
        let terminal = sink.clone();
        let factory = move || {
            PipelineBuilder::<u32>::new("run")
                .stage(PassThroughStage::new("pass"))
                .terminal(terminal.clone())
                .build()
        };

        let pipeline = run_pipeline(&factory, 0..10).unwrap();
        assert!(!pipeline.is_running());
        assert_eq!(sink.len(), 10);
    }

    #[test]
    fn test_run_pipeline_reports_construction_errors() {
        let factory = || -> Result<Pipeline<u32>> {
            Err(ConstructionError::DuplicateBranch {
                pipeline: "broken".to_string(),
                key: "x".to_string(),
            }
            .into())
        };
        let err = run_pipeline(&factory, Vec::new()).unwrap_err();
        assert!(matches!(err, StagepipeError::Construction(_)));
    }
}

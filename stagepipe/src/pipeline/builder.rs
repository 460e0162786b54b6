//! Fluent construction of pipeline nodes.

use super::tree::BranchFactory;
use super::{Pipeline, PipelineConfig};
use crate::driver::{DriverConfig, StageDriverFactory, ThreadDriverFactory};
use crate::errors::{ConstructionError, Result};
use crate::events::StageEventListener;
use crate::feeder::Feeder;
use crate::stages::Stage;
use std::fmt;
use std::sync::Arc;

struct PendingStage<T> {
    stage: Arc<dyn Stage<T>>,
    driver: Option<Arc<dyn StageDriverFactory<T>>>,
}

/// Builder for a pipeline node.
///
/// Nothing is validated until [`PipelineBuilder::build`], which adds stages
/// and branches in the order they were declared.
pub struct PipelineBuilder<T> {
    config: PipelineConfig,
    default_driver: Option<Arc<dyn StageDriverFactory<T>>>,
    stages: Vec<PendingStage<T>>,
    branches: Vec<(String, Pipeline<T>)>,
    listeners: Vec<Arc<dyn StageEventListener>>,
    terminal: Option<Arc<dyn Feeder<T>>>,
    env: Vec<(String, serde_json::Value)>,
    branch_factory: Option<Arc<BranchFactory<T>>>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(PipelineConfig::new(name))
    }

    /// Creates a builder from a configuration.
    #[must_use]
    pub fn from_config(config: PipelineConfig) -> Self {
        let default_driver: Arc<dyn StageDriverFactory<T>> =
            Arc::new(ThreadDriverFactory::from_config(&config.driver));
        Self {
            config,
            default_driver: Some(default_driver),
            stages: Vec::new(),
            branches: Vec::new(),
            listeners: Vec::new(),
            terminal: None,
            env: Vec::new(),
            branch_factory: None,
        }
    }

    /// Replaces the driver settings used by the default thread driver factory.
    #[must_use]
    pub fn driver_config(mut self, driver: DriverConfig) -> Self {
        self.default_driver = Some(Arc::new(ThreadDriverFactory::from_config(&driver)));
        self.config.driver = driver;
        self
    }

    /// Uses `factory` for every stage declared without its own factory.
    #[must_use]
    pub fn driver_factory(mut self, factory: impl StageDriverFactory<T> + 'static) -> Self {
        self.default_driver = Some(Arc::new(factory));
        self
    }

    /// Requires every stage to name its driver factory.
    #[must_use]
    pub fn without_default_driver(mut self) -> Self {
        self.default_driver = None;
        self
    }

    /// Appends a stage driven by the default factory.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage<T> + 'static) -> Self {
        self.stages.push(PendingStage {
            stage: Arc::new(stage),
            driver: None,
        });
        self
    }

    /// Appends a shared stage driven by the default factory.
    #[must_use]
    pub fn shared_stage(mut self, stage: Arc<dyn Stage<T>>) -> Self {
        self.stages.push(PendingStage {
            stage,
            driver: None,
        });
        self
    }

    /// Appends a stage driven by `factory`.
    #[must_use]
    pub fn stage_with(
        mut self,
        stage: impl Stage<T> + 'static,
        factory: impl StageDriverFactory<T> + 'static,
    ) -> Self {
        self.stages.push(PendingStage {
            stage: Arc::new(stage),
            driver: Some(Arc::new(factory)),
        });
        self
    }

    /// Appends a shared stage driven by `factory`.
    #[must_use]
    pub fn shared_stage_with(
        mut self,
        stage: Arc<dyn Stage<T>>,
        factory: impl StageDriverFactory<T> + 'static,
    ) -> Self {
        self.stages.push(PendingStage {
            stage,
            driver: Some(Arc::new(factory)),
        });
        self
    }

    /// Attaches `branch` under `key`.
    #[must_use]
    pub fn branch(mut self, key: impl Into<String>, branch: Pipeline<T>) -> Self {
        self.branches.push((key.into(), branch));
        self
    }

    /// Registers a listener on the tree-wide bus.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn StageEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets the feeder receiving the output of the last stage.
    #[must_use]
    pub fn terminal(mut self, feeder: Arc<dyn Feeder<T>>) -> Self {
        self.terminal = Some(feeder);
        self
    }

    /// Sets an environment value.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.env.push((key.into(), value));
        self
    }

    /// Sets the factory creating branches on first lookup.
    #[must_use]
    pub fn branch_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Pipeline<T>> + Send + Sync + 'static,
    {
        self.branch_factory = Some(Arc::new(factory));
        self
    }

    /// Builds the pipeline node.
    ///
    /// # Errors
    ///
    /// Returns a construction error for a stage without a driver factory, a
    /// failing `init` hook or an invalid branch.
    pub fn build(self) -> Result<Pipeline<T>> {
        let pipeline = match &self.default_driver {
            Some(factory) => Pipeline::with_driver_factory(self.config, Arc::clone(factory)),
            None => Pipeline::with_config(self.config),
        };

        if let Some(terminal) = self.terminal {
            pipeline.set_terminal_feeder(terminal);
        }
        for (key, value) in self.env {
            pipeline.set_env(key, value);
        }
        for listener in self.listeners {
            pipeline.register_listener(listener);
        }
        if let Some(factory) = self.branch_factory {
            pipeline.install_branch_factory(factory);
        }

        for pending in self.stages {
            let factory = pending
                .driver
                .or_else(|| self.default_driver.clone())
                .ok_or_else(|| ConstructionError::MissingDriver {
                    stage: pending.stage.name().to_string(),
                })?;
            pipeline.add_stage(pending.stage, factory.as_ref())?;
        }
        for (key, branch) in self.branches {
            pipeline.add_branch(key, branch)?;
        }
        Ok(pipeline)
    }
}

impl<T> fmt::Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.config.name)
            .field("stages", &self.stages.len())
            .field("branches", &self.branches.len())
            .finish_non_exhaustive()
    }
}

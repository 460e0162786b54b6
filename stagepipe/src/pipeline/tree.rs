//! The pipeline tree.

use super::PipelineConfig;
use crate::context::StageContext;
use crate::core::{StageEvent, StageId, StageRef, StageStatus};
use crate::driver::{StageDriver, StageDriverFactory, ThreadDriverFactory};
use crate::errors::{ConstructionError, Result, StagepipeError};
use crate::events::{EventBus, StageEventListener};
use crate::feeder::{Feeder, NullFeeder};
use crate::stages::Stage;
use crate::utils::generate_uuid;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct StageSlot<T> {
    stage_ref: StageRef,
    stage: Arc<dyn Stage<T>>,
    driver: Arc<dyn StageDriver<T>>,
}

impl<T> Clone for StageSlot<T> {
    fn clone(&self) -> Self {
        Self {
            stage_ref: self.stage_ref.clone(),
            stage: self.stage.clone(),
            driver: self.driver.clone(),
        }
    }
}

/// Creates a branch the first time its key is looked up.
pub(crate) type BranchFactory<T> = dyn Fn(&str) -> Result<Pipeline<T>> + Send + Sync;

/// Shared state of one pipeline node.
///
/// Locks are held only to snapshot or mutate collections; drivers are never
/// started, fed or joined while a lock is held.
pub(crate) struct PipelineInner<T> {
    id: Uuid,
    config: PipelineConfig,
    default_driver: Arc<dyn StageDriverFactory<T>>,
    stages: RwLock<Vec<StageSlot<T>>>,
    branches: DashMap<String, Pipeline<T>>,
    parent: RwLock<Weak<PipelineInner<T>>>,
    bus: EventBus,
    terminal: RwLock<Arc<dyn Feeder<T>>>,
    env: RwLock<HashMap<String, serde_json::Value>>,
    branch_factory: RwLock<Option<Arc<BranchFactory<T>>>>,
    running: AtomicBool,
}

impl<T> PipelineInner<T> {
    fn parent(&self) -> Option<Arc<Self>> {
        self.parent.read().upgrade()
    }

    fn root(self: &Arc<Self>) -> Arc<Self> {
        let mut node = Arc::clone(self);
        while let Some(parent) = node.parent() {
            node = parent;
        }
        node
    }

    /// Runs `f` on the root bus while the root's parent link is read-locked.
    ///
    /// Attaching a node write-locks its parent link while its bus is
    /// absorbed, so `f` never lands on a bus that was just merged away.
    fn with_root_bus<R>(self: &Arc<Self>, f: impl FnOnce(&EventBus) -> R) -> R {
        let mut root = self.root();
        loop {
            let parent = root.parent.read();
            let Some(next) = parent.upgrade() else {
                return f(&root.bus);
            };
            drop(parent);
            root = next.root();
        }
    }

    /// Collects every stage bound anywhere in this node's subtree.
    fn bound_stages(&self) -> Vec<Arc<dyn Stage<T>>> {
        let mut stages: Vec<_> = self
            .stages
            .read()
            .iter()
            .map(|slot| Arc::clone(&slot.stage))
            .collect();
        let branches: Vec<Arc<Self>> = self
            .branches
            .iter()
            .map(|entry| Arc::clone(&entry.value().inner))
            .collect();
        for branch in branches {
            stages.extend(branch.bound_stages());
        }
        stages
    }

    /// True if `candidate` is this node or one of its ancestors.
    fn is_self_or_ancestor(self: &Arc<Self>, candidate: &Arc<Self>) -> bool {
        let mut node = Some(Arc::clone(self));
        while let Some(current) = node {
            if Arc::ptr_eq(&current, candidate) {
                return true;
            }
            node = current.parent();
        }
        false
    }
}

/// A node of a pipeline tree: an ordered chain of stages plus named branches.
///
/// `Pipeline` is a cheap handle; clones refer to the same node. A branch is
/// owned by its parent, and every node of one tree shares the root's event bus.
///
/// # Lifecycle
///
/// [`Pipeline::start`] starts this node's stages in order, then every branch.
/// [`Pipeline::finish`] finishes stages front to back so each stage drains
/// into a successor that is still running, then finishes the branches.
pub struct Pipeline<T> {
    inner: Arc<PipelineInner<T>>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pipeline<T> {
    /// Creates an empty root pipeline with default settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(PipelineConfig::new(name))
    }

    /// Creates an empty root pipeline from a configuration.
    ///
    /// Stages added without an explicit factory get a thread driver built from
    /// `config.driver`.
    #[must_use]
    pub fn with_config(config: PipelineConfig) -> Self {
        let default_driver = Arc::new(ThreadDriverFactory::from_config(&config.driver));
        Self::with_driver_factory(config, default_driver)
    }

    pub(crate) fn with_driver_factory(
        config: PipelineConfig,
        default_driver: Arc<dyn StageDriverFactory<T>>,
    ) -> Self {
        let bus = EventBus::with_log_limit(config.event_log_limit);
        Self {
            inner: Arc::new(PipelineInner {
                id: generate_uuid(),
                config,
                default_driver,
                stages: RwLock::new(Vec::new()),
                branches: DashMap::new(),
                parent: RwLock::new(Weak::new()),
                bus,
                terminal: RwLock::new(Arc::new(NullFeeder)),
                env: RwLock::new(HashMap::new()),
                branch_factory: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PipelineInner<T>>) -> Self {
        Self { inner }
    }

    /// Returns the unique id of this node.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Returns the configuration of this node.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Returns true between a successful `start` and the next `finish`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Appends `stage` and binds it to a driver created by `factory`.
    ///
    /// The stage's `init` hook runs before the driver is created.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` while the pipeline is running, a
    /// `StageAlreadyBound` construction error if `stage` already sits at a
    /// position of this tree, a `StageInit` construction error if `init`
    /// fails, or the factory's error.
    pub fn add_stage(
        &self,
        stage: Arc<dyn Stage<T>>,
        factory: &dyn StageDriverFactory<T>,
    ) -> Result<StageRef> {
        if self.is_running() {
            return Err(StagepipeError::IllegalState(format!(
                "cannot add stage '{}' to running pipeline '{}'",
                stage.name(),
                self.name()
            )));
        }
        let tree_stages = self.inner.root().bound_stages();
        if tree_stages.iter().any(|bound| Arc::ptr_eq(bound, &stage)) {
            return Err(ConstructionError::StageAlreadyBound {
                stage: stage.name().to_string(),
                pipeline: self.name().to_string(),
            }
            .into());
        }

        let stage_ref = StageRef::new(StageId::new(), stage.name());
        let ctx = StageContext::new(Arc::downgrade(&self.inner), stage_ref.clone());
        stage
            .init(&ctx)
            .map_err(|source| ConstructionError::StageInit {
                stage: stage_ref.name.clone(),
                source,
            })?;
        let driver = factory.create_driver(Arc::clone(&stage), ctx)?;

        self.inner.stages.write().push(StageSlot {
            stage_ref: stage_ref.clone(),
            stage,
            driver,
        });
        debug!(
            pipeline = %self.name(),
            stage = %stage_ref.name,
            stage_id = %stage_ref.id,
            "Stage added"
        );
        Ok(stage_ref)
    }

    /// Appends `stage` with this pipeline's default driver factory.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::add_stage`].
    pub fn add_default_stage(&self, stage: Arc<dyn Stage<T>>) -> Result<StageRef> {
        let factory = Arc::clone(&self.inner.default_driver);
        self.add_stage(stage, factory.as_ref())
    }

    /// Returns the stages of this node in chain order.
    #[must_use]
    pub fn stage_refs(&self) -> Vec<StageRef> {
        self.inner
            .stages
            .read()
            .iter()
            .map(|slot| slot.stage_ref.clone())
            .collect()
    }

    /// Returns the driver bound to `stage`.
    #[must_use]
    pub fn driver(&self, stage: StageId) -> Option<Arc<dyn StageDriver<T>>> {
        self.inner
            .stages
            .read()
            .iter()
            .find(|slot| slot.stage_ref.id == stage)
            .map(|slot| Arc::clone(&slot.driver))
    }

    /// Returns the stage registered under `stage`.
    #[must_use]
    pub fn stage(&self, stage: StageId) -> Option<Arc<dyn Stage<T>>> {
        self.inner
            .stages
            .read()
            .iter()
            .find(|slot| slot.stage_ref.id == stage)
            .map(|slot| Arc::clone(&slot.stage))
    }

    /// Returns the run status of `stage`.
    #[must_use]
    pub fn stage_status(&self, stage: StageId) -> Option<StageStatus> {
        self.driver(stage).map(|driver| driver.status())
    }

    /// Attaches `branch` under `key`.
    ///
    /// The branch's listeners and logged events move to this tree's bus. A
    /// branch attached while this pipeline runs is started immediately.
    ///
    /// # Errors
    ///
    /// Returns a construction error if `key` is taken, if `branch` already has
    /// a parent, if `branch` is this node or one of its ancestors, or if a
    /// stage of `branch` is already bound in this tree.
    pub fn add_branch(&self, key: impl Into<String>, branch: Pipeline<T>) -> Result<()> {
        let key = key.into();
        if self.inner.is_self_or_ancestor(&branch.inner) {
            return Err(ConstructionError::BranchCycle {
                pipeline: self.name().to_string(),
                key,
            }
            .into());
        }
        let tree_stages = self.inner.root().bound_stages();
        if let Some(shared) = branch
            .inner
            .bound_stages()
            .into_iter()
            .find(|stage| tree_stages.iter().any(|bound| Arc::ptr_eq(bound, stage)))
        {
            return Err(ConstructionError::StageAlreadyBound {
                stage: shared.name().to_string(),
                pipeline: branch.name().to_string(),
            }
            .into());
        }

        {
            let mut parent = branch.inner.parent.write();
            if parent.upgrade().is_some() {
                return Err(ConstructionError::AlreadyAttached {
                    child: branch.name().to_string(),
                    key,
                }
                .into());
            }
            match self.inner.branches.entry(key.clone()) {
                Entry::Occupied(_) => {
                    return Err(ConstructionError::DuplicateBranch {
                        pipeline: self.name().to_string(),
                        key,
                    }
                    .into());
                }
                Entry::Vacant(slot) => {
                    slot.insert(branch.clone());
                }
            }
            *parent = Arc::downgrade(&self.inner);
            self.inner.with_root_bus(|bus| bus.absorb(&branch.inner.bus));
        }

        debug!(pipeline = %self.name(), branch = %branch.name(), key = %key, "Branch attached");

        if self.is_running() && !branch.is_running() {
            branch.start()?;
        }
        Ok(())
    }

    /// Returns the branch registered under `key`.
    #[must_use]
    pub fn branch(&self, key: &str) -> Option<Pipeline<T>> {
        self.inner.branches.get(key).map(|entry| entry.value().clone())
    }

    /// Returns the branch keys in sorted order.
    #[must_use]
    pub fn branch_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .branches
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn branches_sorted(&self) -> Vec<Pipeline<T>> {
        let mut branches: Vec<(String, Pipeline<T>)> = self
            .inner
            .branches
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        branches.sort_by(|a, b| a.0.cmp(&b.0));
        branches.into_iter().map(|(_, branch)| branch).collect()
    }

    /// Returns the parent node, if this is a branch.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.inner.parent().map(Self::from_inner)
    }

    /// Returns the root of this node's tree.
    #[must_use]
    pub fn root(&self) -> Self {
        Self::from_inner(self.inner.root())
    }

    /// Sets the factory used to create branches on first lookup.
    pub fn set_branch_factory<F>(&self, factory: F)
    where
        F: Fn(&str) -> Result<Self> + Send + Sync + 'static,
    {
        self.install_branch_factory(Arc::new(factory));
    }

    pub(crate) fn install_branch_factory(&self, factory: Arc<BranchFactory<T>>) {
        *self.inner.branch_factory.write() = Some(factory);
    }

    /// Sets the feeder that receives the output of this node's last stage.
    pub fn set_terminal_feeder(&self, feeder: Arc<dyn Feeder<T>>) {
        *self.inner.terminal.write() = feeder;
    }

    /// Returns the feeder that receives the output of this node's last stage.
    #[must_use]
    pub fn terminal_feeder(&self) -> Arc<dyn Feeder<T>> {
        Arc::clone(&self.inner.terminal.read())
    }

    /// Returns the feeder for the stage after `stage`.
    ///
    /// The last stage feeds the terminal feeder.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `stage` is not part of this node.
    pub fn downstream_feeder(&self, stage: StageId) -> Result<Arc<dyn Feeder<T>>> {
        let next = {
            let stages = self.inner.stages.read();
            let position = stages
                .iter()
                .position(|slot| slot.stage_ref.id == stage)
                .ok_or_else(|| {
                    StagepipeError::NotFound(format!(
                        "stage {stage} in pipeline '{}'",
                        self.name()
                    ))
                })?;
            stages.get(position + 1).map(|slot| slot.driver.feeder())
        };
        Ok(next.unwrap_or_else(|| self.terminal_feeder()))
    }

    /// Returns the feeder of this node's first stage, or the terminal feeder
    /// if the node has no stages.
    #[must_use]
    pub fn source_feeder(&self) -> Arc<dyn Feeder<T>> {
        let first = self
            .inner
            .stages
            .read()
            .first()
            .map(|slot| slot.driver.feeder());
        first.unwrap_or_else(|| self.terminal_feeder())
    }

    /// Returns the entry feeder of the branch under `key`.
    ///
    /// A missing branch is created through the branch factory and attached.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the branch is missing and no factory is set, or
    /// the factory's error.
    pub fn branch_feeder(&self, key: &str) -> Result<Arc<dyn Feeder<T>>> {
        if let Some(branch) = self.branch(key) {
            return Ok(branch.source_feeder());
        }

        let factory = self.inner.branch_factory.read().clone();
        let Some(factory) = factory else {
            return Err(StagepipeError::NotFound(format!(
                "branch '{key}' in pipeline '{}'",
                self.name()
            )));
        };

        let created = factory(key)?;
        match self.add_branch(key, created) {
            Ok(()) => {
                debug!(pipeline = %self.name(), key = %key, "Branch created on first use");
            }
            Err(StagepipeError::Construction(ConstructionError::DuplicateBranch { .. })) => {
                debug!(pipeline = %self.name(), key = %key, "Branch created concurrently");
            }
            Err(err) => return Err(err),
        }

        self.branch(key)
            .map(|branch| branch.source_feeder())
            .ok_or_else(|| {
                StagepipeError::NotFound(format!("branch '{key}' in pipeline '{}'", self.name()))
            })
    }

    /// Feeds `item` into this node's first stage.
    ///
    /// # Errors
    ///
    /// Returns the feeder's error, e.g. a closed queue after a stage failure.
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.source_feeder().feed(item)
    }

    /// Sets an environment value visible to this node and its branches.
    pub fn set_env(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.env.write().insert(key.into(), value);
    }

    /// Looks up an environment value on this node, then on its ancestors.
    #[must_use]
    pub fn env(&self, key: &str) -> Option<serde_json::Value> {
        let mut node = Some(Arc::clone(&self.inner));
        while let Some(current) = node {
            if let Some(value) = current.env.read().get(key) {
                return Some(value.clone());
            }
            node = current.parent();
        }
        None
    }

    /// Registers `listener` on the tree-wide bus.
    pub fn register_listener(&self, listener: Arc<dyn StageEventListener>) {
        self.inner.with_root_bus(|bus| bus.register(listener));
    }

    /// Raises `event` on the tree-wide bus.
    pub fn raise(&self, event: StageEvent) {
        let listeners = self.inner.with_root_bus(|bus| bus.record(&event));
        EventBus::deliver(&listeners, &event);
    }

    /// Returns every event raised in this tree, oldest first.
    #[must_use]
    pub fn raised_events(&self) -> Vec<StageEvent> {
        self.inner.with_root_bus(EventBus::events)
    }

    fn slots(&self) -> Vec<StageSlot<T>> {
        self.inner.stages.read().clone()
    }

    /// Starts every stage of this node in order, then every branch.
    ///
    /// If any stage or branch fails to start, everything already started is
    /// finished again.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if the pipeline is already running, or the
    /// first start error.
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StagepipeError::IllegalState(format!(
                "pipeline '{}' is already running",
                self.name()
            )));
        }

        let started = self
            .slots()
            .iter()
            .try_for_each(|slot| slot.driver.start())
            .and_then(|()| {
                self.branches_sorted()
                    .iter()
                    .filter(|branch| !branch.is_running())
                    .try_for_each(Self::start)
            });

        if let Err(err) = started {
            error!(pipeline = %self.name(), error = %err, "Pipeline failed to start");
            self.inner.running.store(false, Ordering::SeqCst);
            if let Err(cleanup) = self.finish() {
                warn!(pipeline = %self.name(), error = %cleanup, "Cleanup after failed start reported an error");
            }
            return Err(err);
        }

        info!(pipeline = %self.name(), stages = self.inner.stages.read().len(), "Pipeline started");
        self.raise(StageEvent::pipeline_started(self.name()));
        Ok(())
    }

    /// Finishes every stage of this node front to back, then every branch.
    ///
    /// All stages and branches are finished even if one fails; the first
    /// error is returned. Finishing a stopped pipeline is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first driver fault or shutdown error encountered.
    pub fn finish(&self) -> Result<()> {
        let mut first_error: Option<StagepipeError> = None;

        for slot in self.slots() {
            if let Err(err) = slot.driver.finish() {
                warn!(
                    pipeline = %self.name(),
                    stage = %slot.stage_ref.name,
                    error = %err,
                    "Stage finished with error"
                );
                first_error.get_or_insert(err);
            }
        }

        for branch in self.branches_sorted() {
            if let Err(err) = branch.finish() {
                first_error.get_or_insert(err);
            }
        }

        if self.inner.running.swap(false, Ordering::SeqCst) {
            let success = first_error.is_none();
            info!(pipeline = %self.name(), success, "Pipeline finished");
            self.raise(StageEvent::pipeline_finished(self.name(), success));
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<String> = self
            .inner
            .stages
            .read()
            .iter()
            .map(|slot| slot.stage_ref.name.clone())
            .collect();
        let mut branches: Vec<String> = self
            .inner
            .branches
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        branches.sort();
        f.debug_struct("Pipeline")
            .field("name", &self.inner.config.name)
            .field("id", &self.inner.id)
            .field("stages", &stages)
            .field("branches", &branches)
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish()
    }
}

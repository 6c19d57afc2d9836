//! Step graph construction and inspection
//!
//! This module wires [`Step`]s into a DAG backed by `daggy`, validating the
//! whole definition (names, dependencies, adapter locators, cycles) before
//! anything runs. Execution lives in [`executor`], rendering in
//! [`visualization`].

mod executor;
pub mod visualization;

use crate::cache::CacheStore;
use crate::config::{ExecutionMode, PipelineConfig};
use crate::error::PipelineError;
use crate::step::Step;
use daggy::petgraph::algo::toposort;
use daggy::{Dag, NodeIndex};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

pub use visualization::{PipelineMetadata, PipelineVisualization, StepSummary, VisualizationEdge};

/// Collects step definitions and validates them into a [`Pipeline`].
///
/// Steps may be added in any order; dependencies are resolved by name in
/// [`PipelineBuilder::build`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    steps: Vec<Step>,
    names: HashSet<String>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        PipelineBuilder {
            config,
            steps: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Adds a step definition
    ///
    /// # Errors
    /// Returns `PipelineError::GraphConstruction` if a step with the same name was already added
    pub fn add_step(&mut self, step: Step) -> Result<&mut Self, PipelineError> {
        if !self.names.insert(step.name().to_string()) {
            return Err(PipelineError::GraphConstruction(format!(
                "duplicate step name '{}'",
                step.name()
            )));
        }
        self.steps.push(step);
        Ok(self)
    }

    /// Validates the definitions and wires the graph
    ///
    /// Fitted state already present in the cache directory is restored into
    /// every trainable step that is not forced to refit.
    ///
    /// # Errors
    /// - `PipelineError::GraphConstruction` for invalid names, unknown dependencies,
    ///   or disk caching requested without a cache directory
    /// - `PipelineError::Resolution` for adapter locators naming undeclared inputs
    /// - `PipelineError::GraphCycle` if the dependencies form a cycle
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let cache = self.config.cache_dir.clone().map(CacheStore::new);

        let mut dag: Dag<Step, ()> = Dag::new();
        let mut index_by_name = HashMap::new();
        for step in self.steps {
            step.validate()?;
            if cache.is_none() && step.cache_policy().requires_disk() {
                return Err(PipelineError::GraphConstruction(format!(
                    "step '{}' persists outputs but no cache directory is configured",
                    step.name()
                )));
            }
            let name = step.name().to_string();
            let index = dag.add_node(step);
            index_by_name.insert(name, index);
        }

        let mut dependencies: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for index in dag.graph().node_indices() {
            let step = &dag[index];
            let mut parents = Vec::with_capacity(step.input_steps().len());
            for dependency in step.input_steps() {
                let parent = index_by_name.get(dependency).copied().ok_or_else(|| {
                    PipelineError::GraphConstruction(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name(),
                        dependency
                    ))
                })?;
                parents.push(parent);
            }
            dependencies.insert(index, parents);
        }

        for (&child, parents) in &dependencies {
            for &parent in parents {
                if dag.add_edge(parent, child, ()).is_err() {
                    return Err(PipelineError::GraphCycle(format!(
                        "adding edge from '{}' to '{}' would create a cycle",
                        dag[parent].name(),
                        dag[child].name()
                    )));
                }
            }
        }

        let pipeline = Pipeline {
            dag,
            index_by_name,
            dependencies,
            cache,
            execution: self.config.execution,
        };
        pipeline.restore_persisted()?;

        info!(
            steps = pipeline.len(),
            edges = pipeline.edge_count(),
            execution = %pipeline.execution,
            "Built pipeline"
        );
        Ok(pipeline)
    }
}

/// A validated, acyclic graph of steps.
///
/// Built once through [`PipelineBuilder`], then executed any number of times
/// with [`Pipeline::fit_transform`] and [`Pipeline::transform`].
#[derive(Debug)]
pub struct Pipeline {
    /// The underlying daggy DAG; edges point from dependency to dependent
    dag: Dag<Step, ()>,
    index_by_name: HashMap<String, NodeIndex>,
    /// Upstream steps of each node, in declared order
    dependencies: HashMap<NodeIndex, Vec<NodeIndex>>,
    cache: Option<CacheStore>,
    execution: ExecutionMode,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Returns the number of steps
    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// Returns the number of step-to-step dependencies
    pub fn edge_count(&self) -> usize {
        self.dag.edge_count()
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution
    }

    pub fn cache_store(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_by_name.contains_key(name)
    }

    /// Gets a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.index_by_name
            .get(name)
            .and_then(|&index| self.dag.node_weight(index))
    }

    /// Names of all steps, in the order they were added
    pub fn step_names(&self) -> Vec<&str> {
        self.dag
            .graph()
            .node_indices()
            .map(|index| self.dag[index].name())
            .collect()
    }

    /// Whether the named step has been fitted or restored in this process
    pub fn is_fitted(&self, name: &str) -> Result<bool, PipelineError> {
        let index = self.index_of(name)?;
        Ok(self.dag[index].is_fitted())
    }

    /// Topological order of the whole graph (dependencies before dependents)
    pub fn execution_order(&self) -> Result<Vec<&str>, PipelineError> {
        let sorted = toposort(self.dag.graph(), None).map_err(|cycle| {
            PipelineError::GraphCycle(format!(
                "step '{}' is part of a cycle",
                self.dag[cycle.node_id()].name()
            ))
        })?;
        Ok(sorted.into_iter().map(|index| self.dag[index].name()).collect())
    }

    /// The transitive dependencies of `target` followed by `target` itself,
    /// in depth-first dependency order.
    pub fn upstream_of(&self, target: &str) -> Result<Vec<&str>, PipelineError> {
        let start = self.index_of(target)?;
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![(start, false)];

        while let Some((index, expanded)) = stack.pop() {
            if expanded {
                order.push(self.dag[index].name());
                continue;
            }
            if !visited.insert(index) {
                continue;
            }
            stack.push((index, true));
            for &parent in self.dependency_indices(index).iter().rev() {
                if !visited.contains(&parent) {
                    stack.push((parent, false));
                }
            }
        }

        Ok(order)
    }

    /// Drops every in-memory cached output. Disk entries are kept.
    pub fn clean_cache(&self) -> Result<(), PipelineError> {
        for index in self.dag.graph().node_indices() {
            self.dag[index].lock_state()?.cached_output = None;
        }
        debug!("Cleared in-memory step outputs");
        Ok(())
    }

    /// Marks every step unfitted and drops in-memory outputs.
    ///
    /// The next fit run restores from disk when an entry exists, or fits again.
    pub fn reset(&self) -> Result<(), PipelineError> {
        for index in self.dag.graph().node_indices() {
            let mut state = self.dag[index].lock_state()?;
            state.fitted = false;
            state.cached_output = None;
        }
        debug!("Reset all steps");
        Ok(())
    }

    /// Deletes the disk entries (fitted state and outputs) of every step.
    pub fn clear_persisted(&self) -> Result<(), PipelineError> {
        if let Some(cache) = &self.cache {
            for index in self.dag.graph().node_indices() {
                cache.remove(self.dag[index].name())?;
            }
            info!(root = %cache.root().display(), "Cleared persisted cache entries");
        }
        Ok(())
    }

    pub(crate) fn index_of(&self, name: &str) -> Result<NodeIndex, PipelineError> {
        self.index_by_name
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::StepNotFound(name.to_string()))
    }

    pub(crate) fn dependency_indices(&self, index: NodeIndex) -> &[NodeIndex] {
        self.dependencies
            .get(&index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn step_at(&self, index: NodeIndex) -> &Step {
        &self.dag[index]
    }

    fn restore_persisted(&self) -> Result<(), PipelineError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };

        for index in self.dag.graph().node_indices() {
            let step = &self.dag[index];
            if !step.is_trainable()
                || step.cache_policy().force_refit
                || !cache.has_transformer(step.name())
            {
                continue;
            }
            let mut state = step.lock_state()?;
            cache.restore_transformer(step.name(), state.transformer.as_mut())?;
            state.fitted = true;
            info!(step = step.name(), "Restored fitted state from cache");
        }
        Ok(())
    }
}

//! Graph vertices: a named transformer with its inputs, adapter and cache policy.

use crate::adapter::Adapter;
use crate::data::DataMap;
use crate::error::PipelineError;
use crate::transformer::Transformer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Caching behavior of a single step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Ignore persisted fitted state on fit calls and fit again.
    ///
    /// Transform-only runs are unaffected: state fitted in this process is
    /// used as is, and a step never fitted in this process lazily restores
    /// whatever state is persisted, even if it predates the forced refit.
    pub force_refit: bool,
    /// Keep the output in memory and reuse it on later runs until the cache is cleaned.
    pub cache_output: bool,
    /// Write the output to the cache directory after every transform.
    pub persist_output: bool,
    /// Reuse a persisted output, skipping this step and everything upstream of it.
    pub load_persisted_output: bool,
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_refit(mut self, force_refit: bool) -> Self {
        self.force_refit = force_refit;
        self
    }

    pub fn cache_output(mut self, cache_output: bool) -> Self {
        self.cache_output = cache_output;
        self
    }

    pub fn persist_output(mut self, persist_output: bool) -> Self {
        self.persist_output = persist_output;
        self
    }

    pub fn load_persisted_output(mut self, load_persisted_output: bool) -> Self {
        self.load_persisted_output = load_persisted_output;
        self
    }

    /// Whether this policy needs a cache directory to operate.
    pub fn requires_disk(&self) -> bool {
        self.persist_output || self.load_persisted_output
    }
}

/// Mutable part of a step, guarded by the step's mutex.
pub(crate) struct StepState {
    pub(crate) transformer: Box<dyn Transformer>,
    pub(crate) fitted: bool,
    pub(crate) cached_output: Option<Arc<DataMap>>,
}

/// A named vertex of the pipeline graph.
///
/// Steps are declared with the names of the steps and external input sources
/// they read from; the graph builder wires them together.
pub struct Step {
    name: String,
    input_steps: Vec<String>,
    input_data: Vec<String>,
    adapter: Option<Adapter>,
    cache_policy: CachePolicy,
    trainable: bool,
    state: Mutex<StepState>,
}

impl Step {
    /// Creates a step owning `transformer`, with no inputs and the default cache policy.
    pub fn new<T: Transformer + 'static>(name: impl Into<String>, transformer: T) -> Self {
        Self::from_boxed(name, Box::new(transformer))
    }

    pub fn from_boxed(name: impl Into<String>, transformer: Box<dyn Transformer>) -> Self {
        let trainable = transformer.is_trainable();
        Step {
            name: name.into(),
            input_steps: Vec::new(),
            input_data: Vec::new(),
            adapter: None,
            cache_policy: CachePolicy::default(),
            trainable,
            state: Mutex::new(StepState {
                transformer,
                fitted: false,
                cached_output: None,
            }),
        }
    }

    /// Upstream steps this step depends on, in order.
    pub fn with_input_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    /// External input sources this step reads, in order.
    pub fn with_input_data<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_data = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_adapter(mut self, adapter: Adapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_steps(&self) -> &[String] {
        &self.input_steps
    }

    pub fn input_data(&self) -> &[String] {
        &self.input_data
    }

    pub fn adapter(&self) -> Option<&Adapter> {
        self.adapter.as_ref()
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache_policy
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Whether the transformer was fitted or restored in this process.
    pub fn is_fitted(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.fitted,
            Err(poisoned) => poisoned.into_inner().fitted,
        }
    }

    /// Whether an in-memory output from a previous run is held.
    pub fn has_cached_output(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.cached_output.is_some(),
            Err(poisoned) => poisoned.into_inner().cached_output.is_some(),
        }
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, StepState>, PipelineError> {
        self.state.lock().map_err(|_| {
            PipelineError::transformer(&self.name, "lock", "step state poisoned by an earlier panic".into())
        })
    }

    /// Checks the parts of the definition that do not depend on the rest of the graph.
    ///
    /// # Errors
    /// - `PipelineError::GraphConstruction` for an unusable name or repeated inputs
    /// - `PipelineError::Resolution` for an adapter locator naming an undeclared input
    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        let name = self.name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(PipelineError::GraphConstruction(format!(
                "invalid step name '{}': names must be non-empty and free of path separators",
                name
            )));
        }

        let mut declared = HashSet::new();
        for input in self.input_steps.iter().chain(self.input_data.iter()) {
            if !declared.insert(input.as_str()) {
                return Err(PipelineError::GraphConstruction(format!(
                    "step '{}' declares input '{}' more than once",
                    name, input
                )));
            }
        }

        if let Some(adapter) = &self.adapter {
            for locator in adapter.locators() {
                if !declared.contains(locator.source.as_str()) {
                    return Err(PipelineError::resolution(
                        name,
                        format!(
                            "adapter locator '{}' refers to undeclared source '{}'",
                            locator, locator.source
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("input_steps", &self.input_steps)
            .field("input_data", &self.input_data)
            .field("adapter", &self.adapter)
            .field("cache_policy", &self.cache_policy)
            .field("trainable", &self.trainable)
            .finish_non_exhaustive()
    }
}

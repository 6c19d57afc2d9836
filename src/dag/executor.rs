//! Pipeline execution: fit-or-restore-then-transform and transform-only runs.
//!
//! A run first plans the steps it needs by walking the target's dependencies
//! depth-first, stopping at steps whose output can be reused (in-memory cached
//! or persisted). The plan lists every step exactly once in dependency order;
//! each planned step then executes at most once and its output is memoized for
//! the rest of the run, so a step shared by several dependents is never
//! evaluated twice.

use super::Pipeline;
use crate::adapter::Sources;
use crate::config::ExecutionMode;
use crate::data::{DataMap, ExternalInput};
use crate::error::PipelineError;
use crate::step::{Step, StepState};
use daggy::NodeIndex;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, info_span, trace};
use uuid::Uuid;

type Memo = HashMap<NodeIndex, Arc<DataMap>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    FitTransform,
    Transform,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::FitTransform => "fit_transform",
            Operation::Transform => "transform",
        }
    }
}

/// Steps one run has to execute, plus outputs reused without execution.
#[derive(Debug, Default)]
struct RunPlan {
    order: Vec<NodeIndex>,
    preloaded: Memo,
}

impl Pipeline {
    /// Fits (or restores) and transforms every step `target` depends on, then `target` itself.
    ///
    /// Trainable steps restore persisted fitted state when it exists and the
    /// step is not forced to refit; otherwise they are fitted on this run's
    /// arguments and the new state is persisted. Every executed step is then
    /// transformed.
    ///
    /// # Arguments
    /// * `target` - Name of the step whose output is returned
    /// * `inputs` - External input sources for this run
    ///
    /// # Errors
    /// Returns `PipelineError` if the target is unknown, an input cannot be
    /// resolved, or a transformer or cache operation fails. Cache entries
    /// finalized before the failure are kept.
    pub fn fit_transform(
        &self,
        target: &str,
        inputs: &ExternalInput,
    ) -> Result<DataMap, PipelineError> {
        self.run(target, inputs, Operation::FitTransform)
    }

    /// Transforms `target` and its dependencies using already fitted state.
    ///
    /// Steps fitted earlier in this process are reused as is; steps with
    /// persisted state are restored lazily.
    ///
    /// # Errors
    /// Returns `PipelineError::NotFitted` before executing anything if a
    /// required trainable step was never fitted and has no persisted state.
    pub fn transform(&self, target: &str, inputs: &ExternalInput) -> Result<DataMap, PipelineError> {
        self.run(target, inputs, Operation::Transform)
    }

    fn run(
        &self,
        target: &str,
        inputs: &ExternalInput,
        operation: Operation,
    ) -> Result<DataMap, PipelineError> {
        let target_index = self.index_of(target)?;
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "pipeline_run",
            %run_id,
            target_step = target,
            operation = operation.as_str()
        );
        let _enter = span.enter();

        let plan = self.plan(target_index, operation)?;
        if operation == Operation::Transform {
            self.check_fitted(&plan.order)?;
        }
        info!(
            steps = plan.order.len(),
            reused = plan.preloaded.len(),
            execution = %self.execution_mode(),
            "Starting run"
        );

        let mut memo = plan.preloaded;
        match self.execution_mode() {
            ExecutionMode::Sequential => {
                for index in plan.order {
                    let output = self.execute_step(index, operation, inputs, &memo)?;
                    memo.insert(index, output);
                }
            }
            ExecutionMode::Parallel => {
                self.run_levels(&plan.order, operation, inputs, &mut memo)?;
            }
        }

        let output = memo.remove(&target_index).ok_or_else(|| {
            PipelineError::resolution(target, "run finished without producing an output")
        })?;
        info!("Run finished");
        Ok(Arc::try_unwrap(output).unwrap_or_else(|shared| (*shared).clone()))
    }

    fn plan(&self, target: NodeIndex, operation: Operation) -> Result<RunPlan, PipelineError> {
        let mut plan = RunPlan::default();
        let mut visited = HashSet::new();
        self.visit(target, operation, &mut visited, &mut plan)?;
        Ok(plan)
    }

    fn visit(
        &self,
        index: NodeIndex,
        operation: Operation,
        visited: &mut HashSet<NodeIndex>,
        plan: &mut RunPlan,
    ) -> Result<(), PipelineError> {
        if !visited.insert(index) {
            return Ok(());
        }
        if let Some(output) = self.reusable_output(self.step_at(index), operation)? {
            plan.preloaded.insert(index, output);
            return Ok(());
        }
        for &parent in self.dependency_indices(index) {
            self.visit(parent, operation, visited, plan)?;
        }
        plan.order.push(index);
        Ok(())
    }

    /// Output that can stand in for executing `step` (and its upstream) in this run.
    fn reusable_output(
        &self,
        step: &Step,
        operation: Operation,
    ) -> Result<Option<Arc<DataMap>>, PipelineError> {
        let policy = step.cache_policy();
        if operation == Operation::FitTransform && policy.force_refit {
            return Ok(None);
        }

        if policy.cache_output {
            if let Some(output) = step.lock_state()?.cached_output.clone() {
                debug!(step = step.name(), "Reusing in-memory output");
                return Ok(Some(output));
            }
        }

        if policy.load_persisted_output {
            if let Some(cache) = self.cache_store() {
                if cache.has_output(step.name()) {
                    let output = cache.load_output(step.name())?;
                    return Ok(Some(Arc::new(output)));
                }
            }
        }

        Ok(None)
    }

    fn check_fitted(&self, order: &[NodeIndex]) -> Result<(), PipelineError> {
        for &index in order {
            let step = self.step_at(index);
            let restorable = self
                .cache_store()
                .is_some_and(|cache| cache.has_transformer(step.name()));
            if step.is_trainable() && !step.is_fitted() && !restorable {
                return Err(PipelineError::NotFitted(step.name().to_string()));
            }
        }
        Ok(())
    }

    /// Runs the plan level by level; steps within a level do not depend on each other.
    ///
    /// A failing level lets its in-flight steps finish and stops before the next level.
    fn run_levels(
        &self,
        order: &[NodeIndex],
        operation: Operation,
        inputs: &ExternalInput,
        memo: &mut Memo,
    ) -> Result<(), PipelineError> {
        for (depth, level) in self.levels(order).into_iter().enumerate() {
            debug!(depth, width = level.len(), "Executing level");
            let resolved = {
                let memo: &Memo = memo;
                level
                    .par_iter()
                    .map(|&index| {
                        self.execute_step(index, operation, inputs, memo)
                            .map(|output| (index, output))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            };
            memo.extend(resolved);
        }
        Ok(())
    }

    /// Groups planned steps by their longest distance from a planned root.
    fn levels(&self, order: &[NodeIndex]) -> Vec<Vec<NodeIndex>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut levels: Vec<Vec<NodeIndex>> = Vec::new();

        for &index in order {
            let level = self
                .dependency_indices(index)
                .iter()
                .filter_map(|parent| depth.get(parent))
                .map(|parent_depth| parent_depth + 1)
                .max()
                .unwrap_or(0);
            depth.insert(index, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(index);
        }

        levels
    }

    fn execute_step(
        &self,
        index: NodeIndex,
        operation: Operation,
        inputs: &ExternalInput,
        memo: &Memo,
    ) -> Result<Arc<DataMap>, PipelineError> {
        let step = self.step_at(index);
        let name = step.name();

        let mut sources = Sources::new();
        for (dependency, parent) in step.input_steps().iter().zip(self.dependency_indices(index)) {
            let output = memo.get(parent).ok_or_else(|| {
                PipelineError::resolution(
                    name,
                    format!("output of upstream step '{}' is not available", dependency),
                )
            })?;
            sources.push(dependency, output);
        }
        for source in step.input_data() {
            let data = inputs.get(source).ok_or_else(|| {
                PipelineError::resolution(
                    name,
                    format!("external input source '{}' was not supplied", source),
                )
            })?;
            sources.push(source, data);
        }

        let args = match step.adapter() {
            Some(adapter) => adapter.resolve(name, &sources)?,
            None => sources.merge(name)?,
        };
        trace!(step = name, args = ?args.keys().collect::<Vec<_>>(), "Resolved call arguments");

        let mut state = step.lock_state()?;
        match operation {
            Operation::FitTransform => self.fit_or_restore(step, &mut state, &args)?,
            Operation::Transform => self.ensure_fitted(step, &mut state)?,
        }

        let output = state
            .transformer
            .transform(&args)
            .map_err(|err| PipelineError::transformer(name, "transform", err))?;
        let output = Arc::new(output);

        let policy = step.cache_policy();
        if policy.persist_output {
            if let Some(cache) = self.cache_store() {
                cache.save_output(name, &output)?;
            }
        }
        if policy.cache_output {
            state.cached_output = Some(Arc::clone(&output));
        }

        debug!(step = name, fields = output.len(), "Step resolved");
        Ok(output)
    }

    fn fit_or_restore(
        &self,
        step: &Step,
        state: &mut StepState,
        args: &DataMap,
    ) -> Result<(), PipelineError> {
        if !step.is_trainable() {
            return Ok(());
        }
        let name = step.name();

        if !step.cache_policy().force_refit {
            if let Some(cache) = self.cache_store() {
                if cache.has_transformer(name) {
                    cache.restore_transformer(name, state.transformer.as_mut())?;
                    state.fitted = true;
                    info!(step = name, "Restored fitted state from cache");
                    return Ok(());
                }
            }
        }

        info!(step = name, "Fitting");
        state
            .transformer
            .fit(args)
            .map_err(|err| PipelineError::transformer(name, "fit", err))?;
        state.fitted = true;

        if let Some(cache) = self.cache_store() {
            cache.persist_transformer(name, state.transformer.as_ref())?;
        }
        Ok(())
    }

    fn ensure_fitted(&self, step: &Step, state: &mut StepState) -> Result<(), PipelineError> {
        if !step.is_trainable() || state.fitted {
            return Ok(());
        }
        let name = step.name();
        if let Some(cache) = self.cache_store() {
            if cache.has_transformer(name) {
                cache.restore_transformer(name, state.transformer.as_mut())?;
                state.fitted = true;
                info!(step = name, "Restored fitted state from cache");
                return Ok(());
            }
        }
        Err(PipelineError::NotFitted(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::adapter::{reducers, Adapter};
    use crate::config::{ExecutionMode, PipelineConfig};
    use crate::dag::Pipeline;
    use crate::data::{data_map, BoxError, DataMap, ExternalInput};
    use crate::error::PipelineError;
    use crate::step::{CachePolicy, Step};
    use crate::testing::{Counters, CountingTransformer};
    use crate::transformer::{IdentityOperation, Transformer};
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn inputs() -> ExternalInput {
        ExternalInput::from([(
            "input".to_string(),
            data_map([("X", json!([1, 2, 3])), ("y", json!([0, 1, 0]))]),
        )])
    }

    /// source -> (left, right) -> join, every step counted.
    fn diamond(config: PipelineConfig) -> (Pipeline, Vec<(&'static str, Counters)>) {
        let mut counters = Vec::new();
        let mut counted = |name: &'static str| {
            let transformer = CountingTransformer::new();
            counters.push((name, transformer.counters()));
            transformer
        };

        let mut builder = Pipeline::builder(config);
        builder
            .add_step(Step::new("source", counted("source")).with_input_data(["input"]))
            .unwrap()
            .add_step(
                Step::new("left", counted("left"))
                    .with_input_steps(["source"])
                    .with_adapter(Adapter::new().map("left_X", ("source", "X"))),
            )
            .unwrap()
            .add_step(
                Step::new("right", counted("right"))
                    .with_input_steps(["source"])
                    .with_adapter(Adapter::new().map("right_y", ("source", "y"))),
            )
            .unwrap()
            .add_step(Step::new("join", counted("join")).with_input_steps(["left", "right"]))
            .unwrap();
        (builder.build().unwrap(), counters)
    }

    #[test]
    fn shared_dependency_runs_once_per_invocation() {
        for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
            let (pipeline, counters) = diamond(PipelineConfig::new().with_execution(mode));
            let output = pipeline.fit_transform("join", &inputs()).unwrap();

            assert_eq!(
                output,
                data_map([("left_X", json!([1, 2, 3])), ("right_y", json!([0, 1, 0]))])
            );
            for (name, counter) in &counters {
                assert_eq!(counter.fits(), 1, "{name} fitted once in {mode} mode");
                assert_eq!(counter.transforms(), 1, "{name} transformed once in {mode} mode");
            }
        }
    }

    #[test]
    fn transform_reuses_fitted_state() {
        let (pipeline, counters) = diamond(PipelineConfig::default());
        pipeline.fit_transform("join", &inputs()).unwrap();

        let fresh = ExternalInput::from([(
            "input".to_string(),
            data_map([("X", json!([7])), ("y", json!([1]))]),
        )]);
        let output = pipeline.transform("join", &fresh).unwrap();
        assert_eq!(output["left_X"], json!([7]));

        for (_, counter) in &counters {
            assert_eq!(counter.fits(), 1);
            assert_eq!(counter.transforms(), 2);
        }
    }

    #[test]
    fn transform_before_fit_fails_without_running_anything() {
        let (pipeline, counters) = diamond(PipelineConfig::default());
        let err = pipeline.transform("join", &inputs()).unwrap_err();
        assert!(matches!(err, PipelineError::NotFitted(_)));
        for (_, counter) in &counters {
            assert_eq!(counter.total(), 0);
        }
    }

    #[test]
    fn second_fit_transform_restores_from_cache_unless_forced() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new().with_cache_dir(dir.path());

        let lazy = CountingTransformer::new();
        let forced = CountingTransformer::new();
        let (lazy_calls, forced_calls) = (lazy.counters(), forced.counters());

        let mut builder = Pipeline::builder(config);
        builder
            .add_step(Step::new("lazy", lazy).with_input_data(["input"]))
            .unwrap()
            .add_step(
                Step::new("forced", forced)
                    .with_input_data(["input"])
                    .with_cache_policy(CachePolicy::new().force_refit(true)),
            )
            .unwrap();
        let pipeline = builder.build().unwrap();

        for _ in 0..2 {
            pipeline.fit_transform("lazy", &inputs()).unwrap();
            pipeline.fit_transform("forced", &inputs()).unwrap();
        }
        assert_eq!(lazy_calls.fits(), 1);
        assert_eq!(forced_calls.fits(), 2);
        assert!(dir.path().join("transformers").join("lazy").is_file());
    }

    #[test]
    fn second_fit_transform_without_cache_fits_again() {
        let transformer = CountingTransformer::new();
        let calls = transformer.counters();

        let mut builder = Pipeline::builder(PipelineConfig::default());
        builder
            .add_step(Step::new("model", transformer).with_input_data(["input"]))
            .unwrap();
        let pipeline = builder.build().unwrap();

        pipeline.fit_transform("model", &inputs()).unwrap();
        let retrain = ExternalInput::from([(
            "input".to_string(),
            data_map([("X", json!([10, 30])), ("weights", json!([1, 1]))]),
        )]);
        pipeline.fit_transform("model", &retrain).unwrap();

        assert_eq!(calls.fits(), 2);
        assert_eq!(calls.transforms(), 2);
        assert!(pipeline.is_fitted("model").unwrap());
    }

    #[test]
    fn missing_external_source_is_a_resolution_error() {
        let (pipeline, _) = diamond(PipelineConfig::default());
        let err = pipeline
            .fit_transform("join", &ExternalInput::new())
            .unwrap_err();
        match err {
            PipelineError::Resolution { step, message } => {
                assert_eq!(step, "source");
                assert!(message.contains("'input'"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_target_is_reported() {
        let (pipeline, _) = diamond(PipelineConfig::default());
        let err = pipeline.fit_transform("nope", &inputs()).unwrap_err();
        assert_eq!(err, PipelineError::StepNotFound("nope".to_string()));
    }

    #[test]
    fn duplicate_keys_in_unadapted_merge_fail() {
        let mut builder = Pipeline::builder(PipelineConfig::default());
        builder
            .add_step(Step::new("a", IdentityOperation).with_input_data(["input"]))
            .unwrap()
            .add_step(Step::new("b", IdentityOperation).with_input_data(["input"]))
            .unwrap()
            .add_step(Step::new("both", IdentityOperation).with_input_steps(["a", "b"]))
            .unwrap();
        let pipeline = builder.build().unwrap();

        let err = pipeline.fit_transform("both", &inputs()).unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn ensemble_reducer_follows_locator_order() {
        let probabilities = |p: serde_json::Value| {
            FixedOutput(data_map([("p", p)]))
        };

        let mut builder = Pipeline::builder(PipelineConfig::default());
        builder
            .add_step(Step::new("A", probabilities(json!([0.2, 0.8]))))
            .unwrap()
            .add_step(Step::new("B", probabilities(json!([0.4, 0.6]))))
            .unwrap()
            .add_step(
                Step::new("ensemble", IdentityOperation)
                    .with_input_steps(["A", "B"])
                    .with_adapter(Adapter::new().reduce(
                        "y_proba",
                        [("B", "p"), ("A", "p")],
                        reducers::to_list(),
                    )),
            )
            .unwrap();
        let pipeline = builder.build().unwrap();

        let output = pipeline.fit_transform("ensemble", &ExternalInput::new()).unwrap();
        assert_eq!(output["y_proba"], json!([[0.4, 0.6], [0.2, 0.8]]));
    }

    #[test]
    fn transformer_failure_carries_step_name() {
        let mut builder = Pipeline::builder(PipelineConfig::default());
        builder
            .add_step(Step::new("solver", FailingFit).with_input_data(["input"]))
            .unwrap();
        let pipeline = builder.build().unwrap();

        let err = pipeline.fit_transform("solver", &inputs()).unwrap_err();
        assert_eq!(err.to_string(), "Step 'solver' failed during fit: singular matrix");
        assert_eq!(err.step(), Some("solver"));
        assert!(matches!(err, PipelineError::Transformer { operation: "fit", .. }));
        assert!(!pipeline.is_fitted("solver").unwrap());

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<SolverError>().is_some());
    }

    #[test]
    fn parallel_failure_stops_later_levels() {
        let sibling = CountingTransformer::new();
        let dependent = CountingTransformer::new();
        let (sibling_calls, dependent_calls) = (sibling.counters(), dependent.counters());

        let mut builder =
            Pipeline::builder(PipelineConfig::new().with_execution(ExecutionMode::Parallel));
        builder
            .add_step(Step::new("solver", FailingFit).with_input_data(["input"]))
            .unwrap()
            .add_step(Step::new("sibling", sibling).with_input_data(["input"]))
            .unwrap()
            .add_step(
                Step::new("report", dependent)
                    .with_input_steps(["solver", "sibling"])
                    .with_adapter(Adapter::new().map("X", ("sibling", "X"))),
            )
            .unwrap();
        let pipeline = builder.build().unwrap();

        let err = pipeline.fit_transform("report", &inputs()).unwrap_err();
        assert_eq!(err.step(), Some("solver"));
        assert!(sibling_calls.transforms() <= 1);
        assert_eq!(dependent_calls.total(), 0);
        assert!(!pipeline.is_fitted("report").unwrap());
    }

    #[test]
    fn cached_output_is_reused_until_cleaned() {
        let transformer = CountingTransformer::new();
        let calls = transformer.counters();

        let mut builder = Pipeline::builder(PipelineConfig::default());
        builder
            .add_step(
                Step::new("features", transformer)
                    .with_input_data(["input"])
                    .with_cache_policy(CachePolicy::new().cache_output(true)),
            )
            .unwrap();
        let pipeline = builder.build().unwrap();

        pipeline.fit_transform("features", &inputs()).unwrap();
        pipeline.transform("features", &ExternalInput::new()).unwrap();
        assert_eq!(calls.transforms(), 1);
        assert!(pipeline.step("features").unwrap().has_cached_output());

        pipeline.clean_cache().unwrap();
        pipeline.transform("features", &inputs()).unwrap();
        assert_eq!(calls.transforms(), 2);
    }

    #[test]
    fn levels_group_independent_steps() {
        let (pipeline, _) = diamond(PipelineConfig::default());
        let order: Vec<_> = ["source", "left", "right", "join"]
            .iter()
            .map(|name| pipeline.index_of(name).unwrap())
            .collect();
        let widths: Vec<usize> = pipeline.levels(&order).iter().map(Vec::len).collect();
        assert_eq!(widths, vec![1, 2, 1]);
    }

    #[derive(Debug)]
    struct SolverError;

    impl std::fmt::Display for SolverError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "singular matrix")
        }
    }

    impl std::error::Error for SolverError {}

    /// Trainable transformer whose fit always fails.
    struct FailingFit;

    impl Transformer for FailingFit {
        fn fit(&mut self, _args: &DataMap) -> Result<(), BoxError> {
            Err(Box::new(SolverError))
        }

        fn transform(&self, args: &DataMap) -> Result<DataMap, BoxError> {
            Ok(args.clone())
        }

        fn persist(&self, _path: &Path) -> Result<(), BoxError> {
            Ok(())
        }

        fn restore(&mut self, _path: &Path) -> Result<(), BoxError> {
            Ok(())
        }
    }

    /// Non-trainable transformer emitting a fixed output.
    struct FixedOutput(DataMap);

    impl Transformer for FixedOutput {
        fn fit(&mut self, _args: &DataMap) -> Result<(), BoxError> {
            Ok(())
        }

        fn transform(&self, _args: &DataMap) -> Result<DataMap, BoxError> {
            Ok(self.0.clone())
        }

        fn persist(&self, _path: &Path) -> Result<(), BoxError> {
            Ok(())
        }

        fn restore(&mut self, _path: &Path) -> Result<(), BoxError> {
            Ok(())
        }

        fn is_trainable(&self) -> bool {
            false
        }
    }
}

//! Pipeline Visualization Support
//!
//! Serializable snapshot of a pipeline's structure and state, plus a Graphviz
//! DOT rendering where external inputs appear as dashed boxes and fitted
//! steps are filled.

use super::Pipeline;
use crate::config::ExecutionMode;
use crate::step::CachePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Represents a step in the visualization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub name: String,
    pub input_steps: Vec<String>,
    pub input_data: Vec<String>,
    /// Target argument names produced by the adapter, empty without one
    pub adapter_keys: Vec<String>,
    pub trainable: bool,
    pub fitted: bool,
    pub cache_policy: CachePolicy,
}

/// Represents an edge in the visualization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizationEdge {
    /// Upstream step or external input name
    pub source: String,
    /// Dependent step name
    pub target: String,
    /// Whether the source is an external input rather than a step
    pub external: bool,
}

/// Metadata about the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetadata {
    pub step_count: usize,
    pub edge_count: usize,
    pub cache_dir: Option<String>,
    pub execution: ExecutionMode,
}

/// Complete pipeline visualization structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineVisualization {
    pub steps: Vec<StepSummary>,
    /// External input sources referenced by any step, sorted
    pub external_inputs: Vec<String>,
    pub edges: Vec<VisualizationEdge>,
    pub metadata: PipelineMetadata,
}

impl Pipeline {
    /// Serializes the pipeline structure for visualization
    pub fn to_visualization(&self) -> PipelineVisualization {
        let mut steps = Vec::with_capacity(self.len());
        let mut edges = Vec::new();
        let mut external_inputs = BTreeSet::new();

        for name in self.step_names() {
            let Some(step) = self.step(name) else {
                continue;
            };

            for upstream in step.input_steps() {
                edges.push(VisualizationEdge {
                    source: upstream.clone(),
                    target: name.to_string(),
                    external: false,
                });
            }
            for source in step.input_data() {
                external_inputs.insert(source.clone());
                edges.push(VisualizationEdge {
                    source: source.clone(),
                    target: name.to_string(),
                    external: true,
                });
            }

            steps.push(StepSummary {
                name: name.to_string(),
                input_steps: step.input_steps().to_vec(),
                input_data: step.input_data().to_vec(),
                adapter_keys: step
                    .adapter()
                    .map(|adapter| adapter.iter().map(|(key, _)| key.clone()).collect())
                    .unwrap_or_default(),
                trainable: step.is_trainable(),
                fitted: step.is_fitted(),
                cache_policy: *step.cache_policy(),
            });
        }

        PipelineVisualization {
            steps,
            external_inputs: external_inputs.into_iter().collect(),
            edges,
            metadata: PipelineMetadata {
                step_count: self.len(),
                edge_count: self.edge_count(),
                cache_dir: self
                    .cache_store()
                    .map(|cache| cache.root().display().to_string()),
                execution: self.execution_mode(),
            },
        }
    }

    /// Renders the pipeline as a Graphviz `digraph`
    pub fn to_dot(&self) -> String {
        let viz = self.to_visualization();
        let mut dot = String::from("digraph pipeline {\n    rankdir=LR;\n");

        for input in &viz.external_inputs {
            let _ = writeln!(dot, "    {} [shape=box, style=dashed];", quote(input));
        }
        for step in &viz.steps {
            let style = if step.fitted { ", style=filled" } else { "" };
            let _ = writeln!(dot, "    {} [shape=ellipse{}];", quote(&step.name), style);
        }
        for edge in &viz.edges {
            let _ = writeln!(dot, "    {} -> {};", quote(&edge.source), quote(&edge.target));
        }

        dot.push_str("}\n");
        dot
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

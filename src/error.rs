//! Error types for pipeline construction and execution

use crate::data::BoxError;
use std::sync::Arc;

/// Error raised by a transformer, kept intact so callers can downcast it.
///
/// Two sources compare equal when their messages do.
#[derive(Debug, Clone)]
pub struct ErrorSource(Arc<dyn std::error::Error + Send + Sync>);

impl ErrorSource {
    pub fn new(err: impl Into<BoxError>) -> Self {
        ErrorSource(Arc::from(err.into()))
    }

    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl PartialEq for ErrorSource {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_string() == other.0.to_string()
    }
}

impl Eq for ErrorSource {}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Error types for pipeline operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Invalid graph definition (duplicate names, unknown dependencies, bad locators)
    GraphConstruction(String),
    /// Cycle detected while wiring step dependencies
    GraphCycle(String),
    /// Requested step does not exist in the graph
    StepNotFound(String),
    /// Adapter locator or external input could not be satisfied
    Resolution { step: String, message: String },
    /// User-supplied reducer failed
    AdapterReduction {
        step: String,
        key: String,
        message: String,
    },
    /// Transform requested on a step that was never fitted nor restorable
    NotFitted(String),
    /// Failure raised by a wrapped transformer
    Transformer {
        step: String,
        operation: &'static str,
        source: ErrorSource,
    },
    /// Cache store read/write failure
    Cache { step: String, message: String },
}

impl PipelineError {
    pub(crate) fn resolution(step: &str, message: impl Into<String>) -> Self {
        PipelineError::Resolution {
            step: step.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn transformer(step: &str, operation: &'static str, err: BoxError) -> Self {
        PipelineError::Transformer {
            step: step.to_string(),
            operation,
            source: ErrorSource::new(err),
        }
    }

    pub(crate) fn cache(step: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::Cache {
            step: step.to_string(),
            message: err.to_string(),
        }
    }

    /// Name of the step the error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            PipelineError::Resolution { step, .. }
            | PipelineError::AdapterReduction { step, .. }
            | PipelineError::Transformer { step, .. }
            | PipelineError::Cache { step, .. } => Some(step),
            PipelineError::NotFitted(step) | PipelineError::StepNotFound(step) => Some(step),
            PipelineError::GraphConstruction(_) | PipelineError::GraphCycle(_) => None,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::GraphConstruction(msg) => write!(f, "Graph construction error: {}", msg),
            PipelineError::GraphCycle(msg) => write!(f, "Cycle detected: {}", msg),
            PipelineError::StepNotFound(name) => write!(f, "Step not found: {}", name),
            PipelineError::Resolution { step, message } => {
                write!(f, "Resolution error in step '{}': {}", step, message)
            }
            PipelineError::AdapterReduction { step, key, message } => write!(
                f,
                "Adapter reduction failed in step '{}' for key '{}': {}",
                step, key, message
            ),
            PipelineError::NotFitted(step) => write!(f, "Step '{}' is not fitted", step),
            PipelineError::Transformer {
                step,
                operation,
                source,
            } => write!(f, "Step '{}' failed during {}: {}", step, operation, source),
            PipelineError::Cache { step, message } => {
                write!(f, "Cache error for step '{}': {}", step, message)
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Transformer { source, .. } => Some(source.inner()),
            _ => None,
        }
    }
}

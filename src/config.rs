//! Pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Environment variable holding the cache directory.
pub const CACHE_DIR_ENV: &str = "STEPGRAPH_CACHE_DIR";
/// Environment variable selecting the execution mode (`sequential` or `parallel`).
pub const EXECUTION_ENV: &str = "STEPGRAPH_EXECUTION";

/// How the steps needed for a run are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Depth-first, one step at a time, in dependency order.
    #[default]
    Sequential,
    /// Independent steps of the same dependency level run on the rayon pool.
    Parallel,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "sequential" | "serial" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let repr = match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        };
        write!(f, "{repr}")
    }
}

/// Configuration shared by every step of a pipeline.
///
/// Without a cache directory nothing is written to disk: fitted state lives
/// only in memory and steps asking for persisted outputs are rejected at
/// build time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base directory for fitted state and persisted outputs
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Scheduling of independent steps
    #[serde(default)]
    pub execution: ExecutionMode,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_dir<P: Into<PathBuf>>(mut self, cache_dir: P) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    /// Reads `STEPGRAPH_CACHE_DIR` and `STEPGRAPH_EXECUTION`.
    ///
    /// Unset variables keep their defaults; an unparsable execution mode
    /// falls back to sequential.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_dir = lookup(CACHE_DIR_ENV)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let execution = lookup(EXECUTION_ENV)
            .and_then(|value| match value.parse::<ExecutionMode>() {
                Ok(mode) => Some(mode),
                Err(err) => {
                    tracing::warn!("{}; using sequential execution", err);
                    None
                }
            })
            .unwrap_or_default();

        PipelineConfig {
            cache_dir,
            execution,
        }
    }
}

//! Step graph execution engine.
//!
//! Steps pair a [`Transformer`] with the upstream steps and external input
//! sources they read. A [`Pipeline`] validates the graph once, then runs
//! `fit_transform` or `transform` on any target step: every transitive
//! dependency executes at most once per run, adapters reshape the data
//! flowing between steps, and fitted state is cached on disk.
//!
//! ```rust,no_run
//! use stepgraph::{data_map, Adapter, ExternalInput, IdentityOperation, Pipeline, PipelineConfig, Step};
//! use serde_json::json;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = Pipeline::builder(PipelineConfig::new().with_cache_dir("cache"));
//! builder
//!     .add_step(Step::new("loader", IdentityOperation).with_input_data(["input"]))?
//!     .add_step(
//!         Step::new("renamed", IdentityOperation)
//!             .with_input_steps(["loader"])
//!             .with_adapter(Adapter::new().map("X", ("loader", "images"))),
//!     )?;
//! let pipeline = builder.build()?;
//!
//! let inputs = ExternalInput::from([(
//!     "input".to_string(),
//!     data_map([("images", json!([[0, 1], [1, 0]]))]),
//! )]);
//! let output = pipeline.fit_transform("renamed", &inputs)?;
//! assert_eq!(output["X"], json!([[0, 1], [1, 0]]));
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod dag;
pub mod data;
pub mod error;
pub mod step;
pub mod telemetry;
pub mod transformer;

#[cfg(test)]
mod testing;

pub use adapter::{reducers, Adapter, AdapterEntry, FnReducer, Locator, Reducer, Sources};
pub use cache::CacheStore;
pub use config::{ExecutionMode, PipelineConfig};
pub use dag::{Pipeline, PipelineBuilder, PipelineVisualization};
pub use data::{data_map, BoxError, DataMap, ExternalInput, Value};
pub use error::{ErrorSource, PipelineError};
pub use step::{CachePolicy, Step};
pub use telemetry::init_tracing;
pub use transformer::{IdentityOperation, Transformer};

//! Transformer capability attached to every step.

use crate::data::{BoxError, DataMap};
use std::path::Path;

/// Capability a step's payload must satisfy.
///
/// The engine only calls these four operations; what a transformer learns and
/// how it lays out its persisted bytes is entirely its own business.
///
/// Implementations must be [`Send`] so that steps can run on worker threads
/// in parallel execution mode.
pub trait Transformer: Send {
    /// Learns internal state from the resolved call arguments.
    fn fit(&mut self, args: &DataMap) -> Result<(), BoxError>;

    /// Produces this step's output from the resolved call arguments.
    ///
    /// Must be callable any number of times after a single `fit`.
    fn transform(&self, args: &DataMap) -> Result<DataMap, BoxError>;

    /// Writes fitted state to `path`.
    fn persist(&self, path: &Path) -> Result<(), BoxError>;

    /// Reads fitted state previously written by [`Transformer::persist`].
    fn restore(&mut self, path: &Path) -> Result<(), BoxError>;

    /// Whether this transformer learns anything from `fit`.
    ///
    /// Non-trainable transformers are never fitted nor persisted and may be
    /// transformed without a prior fit.
    fn is_trainable(&self) -> bool {
        true
    }
}

/// Pass-through transformer: the output is the resolved call arguments.
///
/// Used for steps that exist only to apply an adapter (rename, reshape, merge).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOperation;

impl Transformer for IdentityOperation {
    fn fit(&mut self, _args: &DataMap) -> Result<(), BoxError> {
        Ok(())
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

    fn is_trainable(&self) -> bool {
        false
    }
}

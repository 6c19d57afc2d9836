//! Adapter layer: builds a step's call arguments from upstream outputs.
//!
//! An [`Adapter`] maps each target argument name to an [`AdapterEntry`]:
//! either a single [`Locator`] or an ordered list of locators folded by a
//! [`Reducer`]. Steps without an adapter receive the union of their inputs.

use crate::data::{BoxError, DataMap, Value};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Address of one value: a source (upstream step or external input) and a field in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub source: String,
    pub field: String,
}

impl Locator {
    pub fn new(source: impl Into<String>, field: impl Into<String>) -> Self {
        Locator {
            source: source.into(),
            field: field.into(),
        }
    }
}

impl<S: Into<String>, F: Into<String>> From<(S, F)> for Locator {
    fn from((source, field): (S, F)) -> Self {
        Locator::new(source, field)
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.source, self.field)
    }
}

/// Folds the values extracted by a list of locators into one value.
///
/// Receives the values in the declared locator order. Must be pure with
/// respect to its input for runs to be reproducible.
pub trait Reducer: Send + Sync {
    /// Name used in logs and visualizations.
    fn name(&self) -> &str;

    fn reduce(&self, values: Vec<Value>) -> Result<Value, BoxError>;
}

/// [`Reducer`] backed by a closure.
pub struct FnReducer<F> {
    name: String,
    func: F,
}

impl<F> FnReducer<F>
where
    F: Fn(Vec<Value>) -> Result<Value, BoxError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        FnReducer {
            name: name.into(),
            func,
        }
    }
}

impl<F> Reducer for FnReducer<F>
where
    F: Fn(Vec<Value>) -> Result<Value, BoxError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn reduce(&self, values: Vec<Value>) -> Result<Value, BoxError> {
        (self.func)(values)
    }
}

/// How one target argument is obtained.
#[derive(Clone)]
pub enum AdapterEntry {
    /// Copy a single upstream value.
    Single(Locator),
    /// Extract several values in order and fold them with a reducer.
    Reduce {
        locators: Vec<Locator>,
        reducer: Arc<dyn Reducer>,
    },
}

impl AdapterEntry {
    /// All locators referenced by this entry, in declared order.
    pub fn locators(&self) -> &[Locator] {
        match self {
            AdapterEntry::Single(locator) => std::slice::from_ref(locator),
            AdapterEntry::Reduce { locators, .. } => locators,
        }
    }
}

impl std::fmt::Debug for AdapterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterEntry::Single(locator) => f.debug_tuple("Single").field(locator).finish(),
            AdapterEntry::Reduce { locators, reducer } => f
                .debug_struct("Reduce")
                .field("locators", locators)
                .field("reducer", &reducer.name())
                .finish(),
        }
    }
}

/// Declarative mapping from target argument names to upstream values.
#[derive(Debug, Clone, Default)]
pub struct Adapter {
    entries: BTreeMap<String, AdapterEntry>,
}

impl Adapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `key` to a single upstream value.
    pub fn map(mut self, key: impl Into<String>, locator: impl Into<Locator>) -> Self {
        self.entries
            .insert(key.into(), AdapterEntry::Single(locator.into()));
        self
    }

    /// Maps `key` to the reduction of several upstream values.
    pub fn reduce<I, L>(mut self, key: impl Into<String>, locators: I, reducer: Arc<dyn Reducer>) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<Locator>,
    {
        let locators = locators.into_iter().map(Into::into).collect();
        self.entries
            .insert(key.into(), AdapterEntry::Reduce { locators, reducer });
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: AdapterEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn get(&self, key: &str) -> Option<&AdapterEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AdapterEntry)> {
        self.entries.iter()
    }

    /// Every locator across all entries.
    pub fn locators(&self) -> impl Iterator<Item = &Locator> {
        self.entries.values().flat_map(|entry| entry.locators())
    }

    /// Builds the call arguments for `step` from the available sources.
    ///
    /// # Errors
    /// - [`PipelineError::Resolution`] if a locator's source or field is missing
    /// - [`PipelineError::AdapterReduction`] if a reducer fails
    pub fn resolve(&self, step: &str, sources: &Sources<'_>) -> Result<DataMap, PipelineError> {
        let mut args = DataMap::new();
        for (key, entry) in &self.entries {
            let value = match entry {
                AdapterEntry::Single(locator) => sources.lookup(step, locator)?.clone(),
                AdapterEntry::Reduce { locators, reducer } => {
                    let values = locators
                        .iter()
                        .map(|locator| sources.lookup(step, locator).cloned())
                        .collect::<Result<Vec<_>, _>>()?;
                    reducer
                        .reduce(values)
                        .map_err(|err| PipelineError::AdapterReduction {
                            step: step.to_string(),
                            key: key.clone(),
                            message: err.to_string(),
                        })?
                }
            };
            args.insert(key.clone(), value);
        }
        Ok(args)
    }
}

/// Ordered table of the data visible to one step: upstream outputs and external sources.
#[derive(Debug, Default)]
pub struct Sources<'a> {
    entries: Vec<(&'a str, &'a DataMap)>,
}

impl<'a> Sources<'a> {
    pub fn new() -> Self {
        Sources {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &'a str, data: &'a DataMap) {
        self.entries.push((name, data));
    }

    pub fn get(&self, name: &str) -> Option<&'a DataMap> {
        self.entries
            .iter()
            .find(|(source, _)| *source == name)
            .map(|(_, data)| *data)
    }

    /// Looks up the value addressed by `locator`.
    pub fn lookup(&self, step: &str, locator: &Locator) -> Result<&'a Value, PipelineError> {
        let data = self.get(&locator.source).ok_or_else(|| {
            PipelineError::resolution(
                step,
                format!("source '{}' is not available", locator.source),
            )
        })?;
        data.get(&locator.field).ok_or_else(|| {
            PipelineError::resolution(
                step,
                format!(
                    "field '{}' not found in source '{}'",
                    locator.field, locator.source
                ),
            )
        })
    }

    /// Union of all sources, used when a step declares no adapter.
    ///
    /// A key present in more than one source is an error rather than being
    /// overwritten.
    pub fn merge(&self, step: &str) -> Result<DataMap, PipelineError> {
        let mut merged = DataMap::new();
        let mut origin: BTreeMap<&str, &str> = BTreeMap::new();
        for &(source, data) in &self.entries {
            for (key, value) in data.iter() {
                if let Some(previous) = origin.insert(key.as_str(), source) {
                    return Err(PipelineError::resolution(
                        step,
                        format!(
                            "duplicate key '{}' provided by both '{}' and '{}'; declare an adapter",
                            key, previous, source
                        ),
                    ));
                }
                merged.insert(key.clone(), value.clone());
            }
        }
        Ok(merged)
    }
}

/// Built-in reducers.
pub mod reducers {
    use super::{FnReducer, Reducer};
    use crate::data::{BoxError, Value};
    use std::sync::Arc;

    /// Element-wise mean of numbers or of equal-shaped numeric arrays.
    pub fn mean() -> Arc<dyn Reducer> {
        Arc::new(FnReducer::new(
            "mean",
            |values: Vec<Value>| -> Result<Value, BoxError> { mean_of(&values) },
        ))
    }

    /// Concatenates array values in order.
    pub fn concat() -> Arc<dyn Reducer> {
        Arc::new(FnReducer::new("concat", |values: Vec<Value>| -> Result<Value, BoxError> {
            let mut joined = Vec::new();
            for value in values {
                match value {
                    Value::Array(items) => joined.extend(items),
                    other => return Err(format!("concat expects arrays, got {}", other).into()),
                }
            }
            Ok(Value::Array(joined))
        }))
    }

    /// Collects the values, in order, into one array.
    pub fn to_list() -> Arc<dyn Reducer> {
        Arc::new(FnReducer::new("to_list", |values: Vec<Value>| -> Result<Value, BoxError> {
            Ok(Value::Array(values))
        }))
    }

    fn mean_of(values: &[Value]) -> Result<Value, BoxError> {
        if values.is_empty() {
            return Err("cannot average an empty sequence".into());
        }

        if values.iter().all(Value::is_number) {
            let sum: f64 = values.iter().filter_map(Value::as_f64).sum();
            let mean = sum / values.len() as f64;
            return serde_json::Number::from_f64(mean)
                .map(Value::Number)
                .ok_or_else(|| "mean is not a finite number".into());
        }

        let arrays: Vec<&Vec<Value>> = values.iter().filter_map(Value::as_array).collect();
        if arrays.len() != values.len() {
            return Err("mean expects numbers or arrays, not a mix".into());
        }
        let width = arrays[0].len();
        if arrays.iter().any(|array| array.len() != width) {
            return Err("mean expects arrays of equal length".into());
        }

        (0..width)
            .map(|idx| {
                let column: Vec<Value> = arrays.iter().map(|array| array[idx].clone()).collect();
                mean_of(&column)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }
}

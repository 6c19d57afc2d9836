//! Values moved between steps.
//!
//! The engine never interprets payloads; every value is an opaque
//! [`serde_json::Value`] addressed by source name and field key.

use std::collections::BTreeMap;

pub use serde_json::Value;

/// Named values produced by a transform call or passed into fit/transform.
pub type DataMap = BTreeMap<String, Value>;

/// Caller-supplied data: source name -> field map.
pub type ExternalInput = BTreeMap<String, DataMap>;

/// Opaque error raised by transformers and reducers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Builds a [`DataMap`] from `(key, value)` pairs.
pub fn data_map<K, V, I>(entries: I) -> DataMap
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

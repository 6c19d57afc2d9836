#![allow(dead_code)]

use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stepgraph::{BoxError, DataMap, Transformer};

/// Test helper: learns the mean of the numeric array `x` and subtracts it.
#[derive(Debug, Default)]
pub struct MeanCenter {
    mean: Option<f64>,
    pub fits: Arc<AtomicUsize>,
    pub transforms: Arc<AtomicUsize>,
}

impl MeanCenter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn numbers(args: &DataMap, key: &str) -> Result<Vec<f64>, BoxError> {
    args.get(key)
        .and_then(|value| value.as_array())
        .ok_or_else(|| format!("argument '{}' must be an array", key))?
        .iter()
        .map(|value| value.as_f64().ok_or_else(|| "non-numeric entry".into()))
        .collect()
}

impl Transformer for MeanCenter {
    fn fit(&mut self, args: &DataMap) -> Result<(), BoxError> {
        self.fits.fetch_add(1, Ordering::SeqCst);
        let x = numbers(args, "x")?;
        if x.is_empty() {
            return Err("cannot fit on an empty array".into());
        }
        self.mean = Some(x.iter().sum::<f64>() / x.len() as f64);
        Ok(())
    }

    fn transform(&self, args: &DataMap) -> Result<DataMap, BoxError> {
        self.transforms.fetch_add(1, Ordering::SeqCst);
        let mean = self.mean.ok_or("transform called before fit")?;
        let centered: Vec<f64> = numbers(args, "x")?.iter().map(|v| v - mean).collect();
        let mut output = DataMap::new();
        output.insert("x".to_string(), json!(centered));
        output.insert("mean".to_string(), json!(mean));
        Ok(output)
    }

    fn persist(&self, path: &Path) -> Result<(), BoxError> {
        fs::write(path, serde_json::to_vec(&self.mean)?)?;
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<(), BoxError> {
        self.mean = serde_json::from_slice(&fs::read(path)?)?;
        Ok(())
    }
}

/// Test helper: non-trainable step counting its transform calls.
#[derive(Debug, Default)]
pub struct Probe {
    pub calls: Arc<AtomicUsize>,
}

impl Transformer for Probe {
    fn fit(&mut self, _args: &DataMap) -> Result<(), BoxError> {
        Ok(())
    }

    fn transform(&self, args: &DataMap) -> Result<DataMap, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
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

pub fn count(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

#![allow(dead_code)]

use crate::data::{BoxError, DataMap};
use crate::transformer::Transformer;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared call counters that outlive the transformer moved into a pipeline.
#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    fits: Arc<AtomicUsize>,
    transforms: Arc<AtomicUsize>,
}

impl Counters {
    pub(crate) fn fits(&self) -> usize {
        self.fits.load(Ordering::SeqCst)
    }

    pub(crate) fn transforms(&self) -> usize {
        self.transforms.load(Ordering::SeqCst)
    }

    pub(crate) fn total(&self) -> usize {
        self.fits() + self.transforms()
    }
}

/// Test helper: pass-through transformer that counts calls and remembers the
/// argument keys it was fitted on.
#[derive(Debug, Default)]
pub(crate) struct CountingTransformer {
    counters: Counters,
    seen_keys: Vec<String>,
}

impl CountingTransformer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn counters(&self) -> Counters {
        self.counters.clone()
    }

    pub(crate) fn seen_keys(&self) -> &[String] {
        &self.seen_keys
    }
}

impl Transformer for CountingTransformer {
    fn fit(&mut self, args: &DataMap) -> Result<(), BoxError> {
        self.counters.fits.fetch_add(1, Ordering::SeqCst);
        self.seen_keys = args.keys().cloned().collect();
        Ok(())
    }

    fn transform(&self, args: &DataMap) -> Result<DataMap, BoxError> {
        self.counters.transforms.fetch_add(1, Ordering::SeqCst);
        Ok(args.clone())
    }

    fn persist(&self, path: &Path) -> Result<(), BoxError> {
        fs::write(path, serde_json::to_vec(&self.seen_keys)?)?;
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<(), BoxError> {
        self.seen_keys = serde_json::from_slice(&fs::read(path)?)?;
        Ok(())
    }
}

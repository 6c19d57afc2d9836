//! Disk-backed cache for fitted transformer state and step outputs.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/transformers/<step>     fitted state, written by the transformer itself
//! <root>/outputs/<step>.json     persisted step output
//! ```
//!
//! Every write goes to a temporary file in the destination directory and is
//! renamed into place only once it completed, so an interrupted write never
//! leaves an entry that a later run would accept.

use crate::data::DataMap;
use crate::error::PipelineError;
use crate::transformer::Transformer;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

const TRANSFORMERS_DIR: &str = "transformers";
const OUTPUTS_DIR: &str = "outputs";

/// Per-step persistence rooted at a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Creates a store rooted at `root`. Directories are created lazily on first write.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        CacheStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the fitted state for `step`.
    pub fn transformer_path(&self, step: &str) -> PathBuf {
        self.root.join(TRANSFORMERS_DIR).join(step)
    }

    /// Location of the persisted output for `step`.
    pub fn output_path(&self, step: &str) -> PathBuf {
        self.root.join(OUTPUTS_DIR).join(format!("{}.json", step))
    }

    pub fn has_transformer(&self, step: &str) -> bool {
        self.transformer_path(step).is_file()
    }

    pub fn has_output(&self, step: &str) -> bool {
        self.output_path(step).is_file()
    }

    /// Persists the fitted state of `transformer` for `step`.
    ///
    /// # Returns
    /// The final location of the cache entry
    ///
    /// # Errors
    /// Returns `PipelineError::Transformer` if the transformer's own persist
    /// fails, or `PipelineError::Cache` if the entry cannot be finalized.
    /// In both cases no entry is left at the final location.
    pub fn persist_transformer(
        &self,
        step: &str,
        transformer: &dyn Transformer,
    ) -> Result<PathBuf, PipelineError> {
        let target = self.transformer_path(step);
        self.write_atomic(step, &target, |tmp_path| {
            transformer
                .persist(tmp_path)
                .map_err(|err| PipelineError::transformer(step, "persist", err))
        })?;
        debug!(step, path = %target.display(), "Persisted fitted state");
        Ok(target)
    }

    /// Restores previously persisted fitted state into `transformer`.
    pub fn restore_transformer(
        &self,
        step: &str,
        transformer: &mut dyn Transformer,
    ) -> Result<(), PipelineError> {
        let source = self.transformer_path(step);
        if !source.is_file() {
            return Err(PipelineError::cache(
                step,
                format!("no fitted state at {}", source.display()),
            ));
        }
        transformer
            .restore(&source)
            .map_err(|err| PipelineError::transformer(step, "restore", err))?;
        debug!(step, path = %source.display(), "Restored fitted state");
        Ok(())
    }

    /// Writes `output` as JSON for `step`.
    pub fn save_output(&self, step: &str, output: &DataMap) -> Result<PathBuf, PipelineError> {
        let target = self.output_path(step);
        self.write_atomic(step, &target, |tmp_path| {
            let file = fs::File::create(tmp_path).map_err(|err| PipelineError::cache(step, err))?;
            serde_json::to_writer(file, output).map_err(|err| PipelineError::cache(step, err))
        })?;
        debug!(step, path = %target.display(), "Persisted step output");
        Ok(target)
    }

    /// Reads the persisted output of `step`.
    pub fn load_output(&self, step: &str) -> Result<DataMap, PipelineError> {
        let source = self.output_path(step);
        let file = fs::File::open(&source).map_err(|err| PipelineError::cache(step, err))?;
        let output = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| PipelineError::cache(step, err))?;
        debug!(step, path = %source.display(), "Loaded persisted step output");
        Ok(output)
    }

    /// Deletes every cache entry of `step`. Missing entries are not an error.
    pub fn remove(&self, step: &str) -> Result<(), PipelineError> {
        for path in [self.transformer_path(step), self.output_path(step)] {
            match fs::remove_file(&path) {
                Ok(()) => trace!(step, path = %path.display(), "Removed cache entry"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(PipelineError::cache(step, err)),
            }
        }
        Ok(())
    }

    /// Runs `write` against a temporary file next to `target`, then renames it into place.
    ///
    /// The temporary file is deleted when `write` or the rename fails.
    fn write_atomic<F>(&self, step: &str, target: &Path, write: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&Path) -> Result<(), PipelineError>,
    {
        let dir = target
            .parent()
            .ok_or_else(|| PipelineError::cache(step, "cache path has no parent directory"))?;
        fs::create_dir_all(dir).map_err(|err| PipelineError::cache(step, err))?;

        let tmp = NamedTempFile::new_in(dir).map_err(|err| PipelineError::cache(step, err))?;
        write(tmp.path())?;
        tmp.persist(target)
            .map_err(|err| PipelineError::cache(step, err.error))?;
        Ok(())
    }
}

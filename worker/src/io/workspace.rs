//! Scoped workspace for one evaluation attempt.
//!
//! Each attempt gets a fresh, uniquely named directory holding the staged base
//! description and the generated description. The directory is removed when
//! the [`Workspace`] is dropped, on success, error, and unwinding alike.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::core::description::{BASE_DESCRIPTION_FILE, GENERATED_DESCRIPTION_FILE};
use crate::core::types::ModelId;

/// Exclusively owned staging directory. Not shared between attempts.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
}

impl Workspace {
    /// Create a workspace under `root`, or under the system temp dir.
    pub fn create(root: Option<&Path>, model_id: ModelId) -> Result<Self> {
        let prefix = workspace_prefix(model_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)
                    .with_context(|| format!("create workspace root {}", root.display()))?;
                builder
                    .tempdir_in(root)
                    .with_context(|| format!("create workspace in {}", root.display()))?
            }
            None => builder.tempdir().context("create workspace")?,
        };
        debug!(path = %dir.path().display(), "workspace created");
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    pub fn base_description_path(&self) -> PathBuf {
        self.path().join(BASE_DESCRIPTION_FILE)
    }

    pub fn generated_description_path(&self) -> PathBuf {
        self.path().join(GENERATED_DESCRIPTION_FILE)
    }

    /// Stage the base description verbatim.
    pub fn write_base_description(&self, contents: &str) -> Result<PathBuf> {
        let path = self.base_description_path();
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Write the generated description and return the text read back from disk.
    pub fn write_generated_description(&self, contents: &str) -> Result<String> {
        let path = self.generated_description_path();
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Remove the workspace now, reporting removal errors.
    pub fn close(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                let path = dir.path().to_path_buf();
                dir.close()
                    .with_context(|| format!("remove workspace {}", path.display()))?;
                debug!(path = %path.display(), "workspace removed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                warn!(path = %path.display(), err = %err, "failed to remove workspace");
            }
        }
    }
}

fn workspace_prefix(model_id: ModelId) -> String {
    format!("model-{model_id}-")
}

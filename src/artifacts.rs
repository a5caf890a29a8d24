//! Per-run output directory.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::RunError;

/// `log_dir/run_id/`, holding every file a run writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    /// Creates the directory (and any missing parents).
    pub fn create(log_dir: &Path, run_id: &str) -> Result<Self, RunError> {
        let root = log_dir.join(run_id);
        fs::create_dir_all(&root).map_err(|source| RunError::Artifact {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of artifact `name` inside the run directory. Nothing is created.
    pub fn sneaky_artifact(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn write_text(&self, name: &str, text: &str) -> Result<PathBuf, RunError> {
        let path = self.sneaky_artifact(name);
        fs::write(&path, text).map_err(|source| RunError::Artifact {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Serializes `value` as pretty-printed JSON into artifact `name`.
    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf, RunError> {
        let path = self.sneaky_artifact(name);
        let write = || -> io::Result<()> {
            let mut writer = BufWriter::new(File::create(&path)?);
            serde_json::to_writer_pretty(&mut writer, value)?;
            writer.write_all(b"\n")?;
            writer.flush()
        };
        write().map_err(|source| RunError::Artifact {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

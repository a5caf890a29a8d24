//! Loading saved parameter snapshots and merging them into a freshly built model.
//!
//! Resuming is best effort: a checkpoint is never rejected because it does not match the
//! current model. Unknown keys are dropped, shape mismatches keep the model's own value, and
//! parameters the checkpoint does not mention keep their fresh initialization. Every such
//! decision is reported as a [`ReconcileWarning`]. Only files that cannot be parsed at all are
//! errors.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::params::{ParamStore, ParamTensor};

/// One line of a parameter-trajectory file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub step: u64,
    pub params: ParamStore,
}

/// A recoverable mismatch found while merging a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileWarning {
    /// The checkpoint holds a key the model does not have; it was ignored.
    UnknownKey { key: String },
    /// Shapes differ; the model's own value was kept.
    ShapeMismatch {
        key: String,
        model: Vec<usize>,
        loaded: Vec<usize>,
    },
    /// Model keys the checkpoint had no entry for.
    MissingKeys { keys: Vec<String> },
}

impl fmt::Display for ReconcileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileWarning::UnknownKey { key } => write!(f, "key {key} not in model, ignoring"),
            ReconcileWarning::ShapeMismatch { key, model, loaded } => write!(
                f,
                "key {key} size mismatch, model={model:?}, loaded={loaded:?}"
            ),
            ReconcileWarning::MissingKeys { keys } => write!(
                f,
                "the following keys were not found in loaded state dict: {keys:?}"
            ),
        }
    }
}

/// Merged store plus everything that did not line up.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub store: ParamStore,
    pub warnings: Vec<ReconcileWarning>,
}

/// Merges `loaded` into a copy of `model`.
///
/// For each key of `loaded`: drop it if `model` lacks it, keep `model`'s value if the shapes
/// differ, otherwise let the loaded value win. Takes ownership of `loaded` so no reference to
/// the checkpoint survives the merge.
pub fn reconcile(model: &ParamStore, mut loaded: ParamStore) -> Reconciled {
    let mut warnings = Vec::new();
    let keys: Vec<String> = loaded.keys().map(str::to_string).collect();
    for key in keys {
        match model.get(&key) {
            None => {
                loaded.remove(&key);
                warnings.push(ReconcileWarning::UnknownKey { key });
            }
            Some(fresh) => {
                let shape_differs = loaded
                    .get(&key)
                    .is_some_and(|value| value.shape != fresh.shape);
                if shape_differs {
                    let stale = loaded.insert(key.clone(), fresh.clone());
                    warnings.push(ReconcileWarning::ShapeMismatch {
                        key,
                        model: fresh.shape.clone(),
                        loaded: stale.map(|t: ParamTensor| t.shape).unwrap_or_default(),
                    });
                }
            }
        }
    }

    let missing: Vec<String> = model
        .keys()
        .filter(|k| !loaded.contains(k))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        warnings.push(ReconcileWarning::MissingKeys { keys: missing });
    }

    let mut store = model.clone();
    store.update(loaded);
    Reconciled { store, warnings }
}

/// Reads every snapshot of a trajectory file written by [`crate::sinks::JsonlSamples`].
pub fn read_samples(path: &Path) -> Result<Vec<SampleRecord>, CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            line: i + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Returns the snapshot at `idx`; negative indices count from the end (`-1` is the last).
pub fn load_samples(path: &Path, idx: isize) -> Result<ParamStore, CheckpointError> {
    let mut records = read_samples(path)?;
    if records.is_empty() {
        return Err(CheckpointError::Empty(path.to_path_buf()));
    }
    let len = records.len();
    let resolved = if idx < 0 {
        len.checked_sub(idx.unsigned_abs())
    } else {
        Some(idx as usize).filter(|&i| i < len)
    };
    let position = resolved.ok_or(CheckpointError::Index { idx, len })?;
    Ok(records.swap_remove(position).params)
}

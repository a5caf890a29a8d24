//! Error types for configuring, preparing, and executing a sampling run.
//!
//! Configuration and resource errors abort a run before any long-running work starts.
//! Checkpoint mismatches are not errors at all (see [`crate::checkpoint::ReconcileWarning`]);
//! only unreadable checkpoint files end up here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid run configuration. Always raised before any sink is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown inference mode `{0}`")]
    UnknownInference(String),
    #[error("unknown init_method `{0}`")]
    UnknownInitMethod(String),
    #[error("unknown prior `{0}`")]
    UnknownPrior(String),
    #[error("unknown model `{0}`")]
    UnknownModel(String),
    #[error("unknown sampling_decay `{0}`")]
    UnknownDecay(String),
    #[error("malformed data identifier `{0}`, expected `<name>` or `synthetic.<name>.<prior>`")]
    DataId(String),
    #[error("`{field}` must be positive, got {value}")]
    NonPositive { field: &'static str, value: String },
    #[error("`{field}` is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("temperature must be >= 0, got {0}")]
    NegativeTemperature(f64),
    #[error(
        "n_samples * skip = {product} is not divisible by cycles = {cycles} \
         (n_samples = {n_samples}, skip = {skip})"
    )]
    Indivisible {
        n_samples: usize,
        skip: usize,
        cycles: usize,
        product: usize,
    },
    #[error("schedule arithmetic overflowed for n_samples = {n_samples}, skip = {skip}")]
    Overflow { n_samples: usize, skip: usize },
    #[error("prior `{0}` cannot be sampled from")]
    UnsampleablePrior(String),
    #[error("invalid override `{0}`, expected `key=value`")]
    Override(String),
    #[error("could not parse config: {0}")]
    Parse(String),
}

/// A checkpoint file that cannot be turned into a parameter store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt checkpoint {path} at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint {0} holds no samples")]
    Empty(PathBuf),
    #[error("sample index {idx} out of range for checkpoint with {len} samples")]
    Index { idx: isize, len: usize },
    #[error("parameter store does not fit the model layout: {0}")]
    Layout(String),
}

/// Failure to open, write, or close a persistent sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot open sink {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sink already closed")]
    Closed,
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("sample serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sink io failed: {0}")]
    Io(#[from] io::Error),
}

/// Dataset lookup or loading failure.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("unknown dataset `{0}`")]
    Unknown(String),
    #[error("dataset split `{0}` is empty")]
    Empty(&'static str),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("could not start loader workers: {0}")]
    Workers(String),
}

/// Anything raised inside the sampling run itself.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("non-finite potential {value} at step {step}")]
    NonFinite { step: u64, value: f64 },
    #[error("missing gradient for the parameter vector")]
    MissingGradient,
    #[error("tensor data conversion failed: {0}")]
    TensorData(String),
    #[error("invalid progress bar template: {0}")]
    Progress(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Umbrella error of a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("resource acquisition failed: {0}")]
    Resource(#[source] SinkError),
    #[error("artifact {path} could not be written: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sampling run failed: {0}")]
    Runner(#[from] RunnerError),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

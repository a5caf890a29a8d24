/*!
# Persistent sinks for metrics and parameter trajectories

A run writes two streams: scalar metrics (always) and parameter snapshots (only when
sample-saving is enabled). Both are opened before the sampler starts and closed after it
stops, on every exit path:

- [`Scoped`] closes its sink exactly once, either through [`Scoped::close`] or, if that never
  happens (early return, panic), when it is dropped.
- [`scoped`] opens both sinks, runs a body with them, and closes both whatever the body
  returned. An acquisition failure is reported before the body runs.

When sample-saving is disabled [`SampleSaver::Disabled`] stands in for the trajectory file and
accepts every record without doing anything.
*/

pub mod csv;
pub mod jsonl;

pub use self::csv::CsvMetrics;
pub use self::jsonl::JsonlSamples;

use std::ops::{Deref, DerefMut};
use std::path::Path;

use crate::error::{RunError, SinkError};
use crate::params::ParamStore;

/// Lifecycle shared by all sinks.
pub trait Sink {
    fn flush(&mut self) -> Result<(), SinkError>;

    /// Flushes and releases the underlying handle. Writes after closing fail.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Periodic scalar records.
pub trait MetricsSink: Sink {
    fn add_scalar(&mut self, name: &str, step: u64, value: f64) -> Result<(), SinkError>;
}

/// Parameter snapshots.
pub trait SampleSink: Sink {
    fn add_sample(&mut self, step: u64, params: &ParamStore) -> Result<(), SinkError>;
}

/// Parameter-trajectory sink, or nothing when sample-saving is off.
#[derive(Debug)]
pub enum SampleSaver {
    Jsonl(JsonlSamples),
    Disabled,
}

impl SampleSaver {
    /// Opens `path` if `enabled`, otherwise returns the no-op variant without touching disk.
    pub fn open(path: &Path, enabled: bool) -> Result<Self, SinkError> {
        if enabled {
            Ok(SampleSaver::Jsonl(JsonlSamples::create(path)?))
        } else {
            Ok(SampleSaver::Disabled)
        }
    }
}

impl Sink for SampleSaver {
    fn flush(&mut self) -> Result<(), SinkError> {
        match self {
            SampleSaver::Jsonl(inner) => inner.flush(),
            SampleSaver::Disabled => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        match self {
            SampleSaver::Jsonl(inner) => inner.close(),
            SampleSaver::Disabled => Ok(()),
        }
    }
}

impl SampleSink for SampleSaver {
    fn add_sample(&mut self, step: u64, params: &ParamStore) -> Result<(), SinkError> {
        match self {
            SampleSaver::Jsonl(inner) => inner.add_sample(step, params),
            SampleSaver::Disabled => Ok(()),
        }
    }
}

/// Guard that closes the wrapped sink exactly once.
pub struct Scoped<S: Sink> {
    inner: S,
    closed: bool,
}

impl<S: Sink> Scoped<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    /// Closes the sink and reports the outcome; the drop guard is disarmed either way.
    pub fn close(mut self) -> Result<(), SinkError> {
        self.closed = true;
        self.inner.close()
    }
}

impl<S: Sink> Deref for Scoped<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.inner
    }
}

impl<S: Sink> DerefMut for Scoped<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: Sink> Drop for Scoped<S> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(err) = self.inner.close() {
                tracing::error!(%err, "failed to close sink during unwind");
            }
        }
    }
}

/// Both sinks of a run, acquired together.
pub struct SinkScope<M: MetricsSink, S: SampleSink> {
    metrics: Scoped<M>,
    samples: Scoped<S>,
}

impl<M: MetricsSink, S: SampleSink> SinkScope<M, S> {
    /// Opens the metrics sink, then the sample sink. If the second open fails the first sink is
    /// closed before the error is returned.
    pub fn open(
        open_metrics: impl FnOnce() -> Result<M, SinkError>,
        open_samples: impl FnOnce() -> Result<S, SinkError>,
    ) -> Result<Self, SinkError> {
        let metrics = Scoped::new(open_metrics()?);
        let samples = Scoped::new(open_samples()?);
        Ok(Self { metrics, samples })
    }

    pub fn sinks(&mut self) -> (&mut M, &mut S) {
        (&mut *self.metrics, &mut *self.samples)
    }

    /// Closes both sinks unconditionally and returns the first failure.
    pub fn close(self) -> Result<(), SinkError> {
        let metrics = self.metrics.close();
        let samples = self.samples.close();
        metrics.and(samples)
    }
}

/// Runs `body` between opening and closing both sinks.
///
/// Acquisition failures surface as [`RunError::Resource`] before `body` runs. An error from
/// `body` takes precedence over a failure to close; the sinks are closed in both cases.
pub fn scoped<M, S, T>(
    open_metrics: impl FnOnce() -> Result<M, SinkError>,
    open_samples: impl FnOnce() -> Result<S, SinkError>,
    body: impl FnOnce(&mut M, &mut S) -> Result<T, RunError>,
) -> Result<T, RunError>
where
    M: MetricsSink,
    S: SampleSink,
{
    let mut scope = SinkScope::open(open_metrics, open_samples).map_err(RunError::Resource)?;
    let outcome = {
        let (metrics, samples) = scope.sinks();
        body(metrics, samples)
    };
    let released = scope.close();
    let value = outcome?;
    released.map_err(RunError::Resource)?;
    Ok(value)
}

/*!
# Sampling runners

Every inference mode maps onto one of two runner shapes:

| mode               | runner                                   |
|--------------------|------------------------------------------|
| `SGLD`             | cyclic, Langevin integrator              |
| `VerletSGLD`       | cyclic, Verlet integrator                |
| `OurHMC`           | cyclic, momentum integrator              |
| `HMCReject`        | cyclic, momentum integrator + MH test    |
| `VerletSGLDReject` | cyclic, Verlet integrator + MH test      |
| `HMC`              | [`Mcmc`] driving the [`crate::hmc::HMC`] kernel |

Cyclic runners share one constructor: the model, the train and test loaders, the
[`Schedule`](crate::schedule::Schedule), the hyperparameters, and both sinks. The HMC kernel
takes a potential over the full training set, a fixed step size, and a fixed number of
leapfrog steps instead, and writes to no sink.
*/

pub mod cyclic;
pub mod kernel;

pub use cyclic::{CyclicHyper, CyclicRunner, CyclicVariant, Integrator};
pub use kernel::{KernelSpec, Mcmc};

use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::InferenceMode;
use crate::error::RunnerError;
use crate::model::PosteriorModel;
use crate::params::ParamStore;

/// A sampler that is built once, run once, and then asked for its samples.
pub trait SamplingRunner {
    fn run(&mut self, progressbar: bool) -> Result<(), RunnerError>;

    /// Collected parameter snapshots, oldest first.
    fn get_samples(&self) -> &[ParamStore];
}

/// Progress bar in the style shared by all runners.
pub(crate) fn progress_bar(len: u64, prefix: &str) -> Result<ProgressBar, RunnerError> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
            .map_err(|e| RunnerError::Progress(e.to_string()))?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    Ok(pb)
}

/// How a run for a given inference mode has to be constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunnerSpec {
    Cyclic(CyclicVariant),
    Kernel(KernelSpec),
}

impl RunnerSpec {
    pub fn select(mode: InferenceMode) -> Self {
        let cyclic = |integrator, rejection| RunnerSpec::Cyclic(CyclicVariant { integrator, rejection });
        match mode {
            InferenceMode::Sgld => cyclic(Integrator::Langevin, false),
            InferenceMode::VerletSgld => cyclic(Integrator::Verlet, false),
            InferenceMode::OurHmc => cyclic(Integrator::Momentum, false),
            InferenceMode::HmcReject => cyclic(Integrator::Momentum, true),
            InferenceMode::VerletSgldReject => cyclic(Integrator::Verlet, true),
            InferenceMode::Hmc => RunnerSpec::Kernel(KernelSpec::FIXED),
        }
    }

    /// Whether this runner follows a cyclic schedule (and therefore needs one).
    pub fn is_cyclic(&self) -> bool {
        matches!(self, RunnerSpec::Cyclic(_))
    }
}

/// The runner of one run.
pub enum Runner<'a, B: AutodiffBackend, M: PosteriorModel<B>> {
    Cyclic(CyclicRunner<'a, B, M>),
    Kernel(Mcmc<'a, B, M>),
}

impl<B: AutodiffBackend, M: PosteriorModel<B>> SamplingRunner for Runner<'_, B, M> {
    fn run(&mut self, progressbar: bool) -> Result<(), RunnerError> {
        match self {
            Runner::Cyclic(runner) => runner.run(progressbar),
            Runner::Kernel(runner) => runner.run(progressbar),
        }
    }

    fn get_samples(&self) -> &[ParamStore] {
        match self {
            Runner::Cyclic(runner) => runner.get_samples(),
            Runner::Kernel(runner) => runner.get_samples(),
        }
    }
}

//! Plain HMC over the full training set.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use tracing::debug;

use super::{progress_bar, SamplingRunner};
use crate::data::DataLoader;
use crate::error::RunnerError;
use crate::hmc::{PotentialTarget, HMC};
use crate::model::PosteriorModel;
use crate::params::ParamStore;
use crate::stats::AcceptanceWindow;

/// Fixed kernel settings; the kernel never adapts them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelSpec {
    pub step_size: f64,
    pub num_steps: usize,
}

impl KernelSpec {
    pub const FIXED: KernelSpec = KernelSpec {
        step_size: 1e-3,
        num_steps: 32,
    };
}

/// Potential of the model on the whole training set.
struct FullData<'m, B: AutodiffBackend, M> {
    model: &'m M,
    x: Tensor<B, 2>,
    y: Tensor<B, 2>,
    num_data: usize,
}

impl<B: AutodiffBackend, M: PosteriorModel<B>> PotentialTarget<B> for FullData<'_, B, M> {
    fn potential(&self, theta: &Tensor<B, 1>) -> Tensor<B, 1> {
        self.model
            .potential(theta, self.x.clone(), self.y.clone(), self.num_data)
    }
}

/// Runs `warmup_steps` discarded steps, then keeps every one of `num_samples` steps.
pub struct Mcmc<'a, B: AutodiffBackend, M: PosteriorModel<B>> {
    model: &'a mut M,
    spec: KernelSpec,
    warmup_steps: usize,
    num_samples: usize,
    x: Tensor<B, 2>,
    y: Tensor<B, 2>,
    seed: u64,
    samples: Vec<ParamStore>,
}

impl<'a, B: AutodiffBackend, M: PosteriorModel<B>> Mcmc<'a, B, M> {
    /// Starts from the model's current parameters and reads the whole of `train` once.
    pub fn new(
        model: &'a mut M,
        spec: KernelSpec,
        train: &DataLoader,
        warmup_steps: usize,
        num_samples: usize,
        seed: u64,
    ) -> Result<Self, RunnerError> {
        let (x, y) = train.full_batch()?.to_tensors::<B>(model.device());
        Ok(Self {
            model,
            spec,
            warmup_steps,
            num_samples,
            x,
            y,
            seed,
            samples: Vec::with_capacity(num_samples),
        })
    }

    pub fn spec(&self) -> KernelSpec {
        self.spec
    }
}

impl<B: AutodiffBackend, M: PosteriorModel<B>> SamplingRunner for Mcmc<'_, B, M> {
    fn run(&mut self, progressbar: bool) -> Result<(), RunnerError> {
        let target = FullData {
            model: &*self.model,
            x: self.x.clone(),
            y: self.y.clone(),
            num_data: self.x.dims()[0],
        };
        let initial = self.model.params();
        let mut kernel =
            HMC::new(target, initial, self.spec.step_size, self.spec.num_steps).set_seed(self.seed);

        let pb = if progressbar {
            Some(progress_bar(
                (self.warmup_steps + self.num_samples) as u64,
                "HMC",
            )?)
        } else {
            None
        };

        let mut acceptance = AcceptanceWindow::default();
        let layout = self.model.layout().clone();
        let mut samples = Vec::with_capacity(self.num_samples);
        for i in 0..self.warmup_steps + self.num_samples {
            let transition = kernel.step()?;
            acceptance.push(transition.accepted);
            if i >= self.warmup_steps {
                samples.push(layout.store_from_tensor(kernel.position().clone())?);
            }
            if let Some(pb) = &pb {
                pb.inc(1);
                pb.set_message(format!(
                    "p(accept)≈{:.2} U≈{:.3e}",
                    acceptance.rate().unwrap_or(0.0),
                    transition.potential
                ));
            }
        }
        debug!(
            acceptance = acceptance.rate().unwrap_or(0.0),
            samples = samples.len(),
            "HMC kernel finished"
        );
        if let Some(pb) = pb {
            pb.finish_with_message("Done!");
        }

        let last = kernel.position().clone();
        drop(kernel);
        self.model.set_params(last);
        self.samples = samples;
        Ok(())
    }

    fn get_samples(&self) -> &[ParamStore] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;
    use crate::data::{DatasetProvider, ToyDatasets};
    use crate::model::{get_model, ModelSpec};
    use crate::prior::{Prior, PriorFamily};
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    type B = Autodiff<NdArray>;

    #[test]
    fn test_collects_requested_samples() {
        B::seed(0);
        let dataset = ToyDatasets::new(30, 10, 0).dataset("toy_regression").unwrap();
        let spec = ModelSpec {
            n_features: 1,
            n_outputs: 1,
            task: dataset.task,
            width: 4,
            depth: 2,
            weight_prior: Prior::new(PriorFamily::Gaussian, 0.0, 1.0),
            bias_prior: Prior::new(PriorFamily::Gaussian, 0.0, 1.0),
            noise_std: 1.0,
        };
        let mut rng = SmallRng::seed_from_u64(0);
        let mut model =
            get_model::<B>(ModelKind::DenseNet, spec, &NdArrayDevice::Cpu, &mut rng).unwrap();
        let loader = DataLoader::new(Arc::clone(&dataset.train), 7, true, 0, 0).unwrap();
        let mut mcmc = Mcmc::new(&mut model, KernelSpec::FIXED, &loader, 3, 5, 0).unwrap();
        assert_eq!(mcmc.spec(), KernelSpec::FIXED);
        mcmc.run(false).unwrap();
        let samples = mcmc.get_samples();
        assert_eq!(samples.len(), 5);
        assert!(samples[0].contains("layers.1.bias"));
    }
}

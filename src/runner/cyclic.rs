/*!
# Cyclic stochastic-gradient samplers

All five cyclic modes share one loop. A run is `cycles` repetitions of
`warmup + burnin + sample` epochs; the step size follows the configured decay within each
cycle and restarts at the next one. Warmup epochs run at temperature zero (pure optimization),
burnin and sample epochs at the configured temperature. After every `skip`-th sampling epoch,
counted across all cycles, the current parameters are kept as a sample.

Updates work on the per-datum potential `u = U / N` estimated from a mini-batch. With step size
`lr`, temperature `T`, diagonal preconditioner `P`, and standard normal noise `xi`:

- Langevin: `theta += -lr * P * grad u + sqrt(2 * lr * T * P / N) * xi`.
- Momentum: the momentum is partially refreshed, `p = a * p + sqrt((1 - a^2) * T / P) * xi`,
  then `p -= eps * grad U` and `theta += eps * P * p` with `eps = sqrt(lr / N)`.
- Verlet: the same refresh followed by a half-step, full-step, half-step leapfrog update that
  reuses the gradient from the end of the previous step.

The rejection variants add a Metropolis-Hastings test at the end of each epoch on the
full-data energy `H = U(theta) + sum(P * p^2) / 2`, accepting with probability
`min(1, exp(-(H_new - H_old) / T))`. A rejected epoch is rolled back when `reject_samples` is
set and only counted otherwise.

`P` is `1 / (sqrt(E[grad u^2]) + eps)` normalized to unit mean, re-estimated from the gradients
seen since the last refresh every `precond_update` epochs.
*/

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use burn::tensor::Distribution;
use rand::prelude::*;
use tracing::debug;

use super::{progress_bar, SamplingRunner};
use crate::config::SamplingDecay;
use crate::data::{Batch, DataLoader};
use crate::error::RunnerError;
use crate::model::PosteriorModel;
use crate::params::{tensor_to_vec, ParamStore};
use crate::schedule::{Phase, Schedule};
use crate::sinks::{MetricsSink, SampleSink};
use crate::stats::{AcceptanceWindow, RunningMoments};

const PRECOND_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrator {
    Langevin,
    Verlet,
    Momentum,
}

/// Dynamics of a cyclic runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicVariant {
    pub integrator: Integrator,
    /// Metropolis-Hastings test at the end of each epoch.
    pub rejection: bool,
}

impl CyclicVariant {
    pub fn name(&self) -> &'static str {
        match (self.integrator, self.rejection) {
            (Integrator::Langevin, _) => "SGLD",
            (Integrator::Verlet, false) => "VerletSGLD",
            (Integrator::Verlet, true) => "VerletSGLDReject",
            (Integrator::Momentum, false) => "OurHMC",
            (Integrator::Momentum, true) => "HMCReject",
        }
    }
}

/// Hyperparameters shared by every cyclic runner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclicHyper {
    pub lr: f64,
    pub skip: usize,
    pub metrics_skip: usize,
    pub sampling_decay: SamplingDecay,
    pub temperature: f64,
    pub momentum: f64,
    pub precond_update: Option<usize>,
    pub reject_samples: bool,
    pub seed: u64,
}

/// Integrator state carried from step to step.
struct State<B: AutodiffBackend> {
    theta: Tensor<B, 1>,
    momentum: Tensor<B, 1>,
    precond: Tensor<B, 1>,
    /// Gradient of `u` at `theta`, kept by the Verlet integrator.
    grad: Option<Tensor<B, 1>>,
}

impl<B: AutodiffBackend> Clone for State<B> {
    fn clone(&self) -> Self {
        Self {
            theta: self.theta.clone(),
            momentum: self.momentum.clone(),
            precond: self.precond.clone(),
            grad: self.grad.clone(),
        }
    }
}

pub struct CyclicRunner<'a, B: AutodiffBackend, M: PosteriorModel<B>> {
    model: &'a mut M,
    train: DataLoader,
    test: DataLoader,
    schedule: Schedule,
    hyper: CyclicHyper,
    variant: CyclicVariant,
    metrics: &'a mut dyn MetricsSink,
    sample_sink: &'a mut dyn SampleSink,
    samples: Vec<ParamStore>,
    rng: SmallRng,
    acceptance: AcceptanceWindow,
    step: u64,
    _backend: std::marker::PhantomData<B>,
}

impl<'a, B: AutodiffBackend, M: PosteriorModel<B>> CyclicRunner<'a, B, M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: &'a mut M,
        train: DataLoader,
        test: DataLoader,
        schedule: Schedule,
        hyper: CyclicHyper,
        variant: CyclicVariant,
        metrics: &'a mut dyn MetricsSink,
        sample_sink: &'a mut dyn SampleSink,
    ) -> Self {
        Self {
            model,
            train,
            test,
            schedule,
            hyper,
            variant,
            metrics,
            sample_sink,
            samples: Vec::with_capacity(schedule.n_samples()),
            rng: SmallRng::seed_from_u64(hyper.seed),
            acceptance: AcceptanceWindow::default(),
            step: 0,
            _backend: std::marker::PhantomData,
        }
    }

    pub fn variant(&self) -> CyclicVariant {
        self.variant
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    fn device(&self) -> B::Device {
        self.model.device().clone()
    }

    /// `u = U / N` on a batch and its gradient with respect to `theta`.
    fn potential_and_grad(
        &self,
        theta: &Tensor<B, 1>,
        batch: &Batch,
    ) -> Result<(f64, Tensor<B, 1>), RunnerError> {
        let n_data = self.train.dataset_len();
        let (x, y) = batch.to_tensors::<B>(&self.device());
        let theta = theta.clone().detach().require_grad();
        let u = self
            .model
            .potential(&theta, x, y, n_data)
            .div_scalar(n_data as f64);
        let value = self.finite(u.clone().into_scalar().to_f64())?;
        let grads = u.backward();
        let grad = theta.grad(&grads).ok_or(RunnerError::MissingGradient)?;
        Ok((value, Tensor::from_inner(grad)))
    }

    /// `u = U / N` on a batch, without a gradient.
    fn batch_potential(&self, theta: &Tensor<B, 1>, batch: &Batch) -> Result<f64, RunnerError> {
        let n_data = self.train.dataset_len();
        let (x, y) = batch.to_tensors::<B>(&self.device());
        let value = self
            .model
            .potential(theta, x, y, n_data)
            .into_scalar()
            .to_f64()
            / n_data as f64;
        self.finite(value)
    }

    fn finite(&self, value: f64) -> Result<f64, RunnerError> {
        if value.is_finite() {
            Ok(value)
        } else {
            Err(RunnerError::NonFinite {
                step: self.step,
                value,
            })
        }
    }

    /// Full-data potential `U(theta)`.
    fn full_potential(&self, theta: &Tensor<B, 1>) -> Result<f64, RunnerError> {
        let mut log_lik = 0.0;
        for batch in self.train.ordered() {
            let (x, y) = batch?.to_tensors::<B>(&self.device());
            log_lik += self
                .model
                .log_likelihood(theta, x, y)
                .sum()
                .into_scalar()
                .to_f64();
        }
        let log_prior = self.model.log_prior(theta).into_scalar().to_f64();
        Ok(-(log_lik + log_prior))
    }

    /// Mean log likelihood per test point.
    fn test_log_likelihood(&self, theta: &Tensor<B, 1>) -> Result<f64, RunnerError> {
        let mut total = 0.0;
        for batch in self.test.ordered() {
            let (x, y) = batch?.to_tensors::<B>(&self.device());
            total += self
                .model
                .log_likelihood(theta, x, y)
                .sum()
                .into_scalar()
                .to_f64();
        }
        Ok(total / self.test.dataset_len() as f64)
    }

    fn noise(&self, dim: usize) -> Tensor<B, 1> {
        Tensor::<B, 1>::random([dim], Distribution::Normal(0.0, 1.0), &self.device())
    }

    /// One integrator step on `batch`; returns the batch potential `u` before the step.
    fn update(
        &self,
        state: &mut State<B>,
        batch: &Batch,
        lr: f64,
        temperature: f64,
        moments: &mut RunningMoments,
    ) -> Result<f64, RunnerError> {
        let n_data = self.train.dataset_len() as f64;
        let dim = state.theta.dims()[0];
        let (u, grad) = match state.grad.take() {
            Some(grad) if self.variant.integrator == Integrator::Verlet => {
                (self.batch_potential(&state.theta, batch)?, grad)
            }
            _ => self.potential_and_grad(&state.theta, batch)?,
        };
        moments.push(&tensor_to_vec(grad.clone())?);

        match self.variant.integrator {
            Integrator::Langevin => {
                let drift = grad.mul(state.precond.clone()).mul_scalar(lr);
                let diffusion = state
                    .precond
                    .clone()
                    .sqrt()
                    .mul(self.noise(dim))
                    .mul_scalar((2.0 * lr * temperature / n_data).sqrt());
                state.theta = (state.theta.clone() - drift + diffusion).detach();
            }
            Integrator::Momentum => {
                let eps = (lr / n_data).sqrt();
                self.refresh(state, temperature, dim);
                // grad U = N * grad u
                state.momentum = state.momentum.clone() - grad.mul_scalar(eps * n_data);
                state.theta = (state.theta.clone()
                    + state.momentum.clone().mul(state.precond.clone()).mul_scalar(eps))
                .detach();
            }
            Integrator::Verlet => {
                let eps = (lr / n_data).sqrt();
                let half = 0.5 * eps * n_data;
                self.refresh(state, temperature, dim);
                state.momentum = state.momentum.clone() - grad.mul_scalar(half);
                state.theta = (state.theta.clone()
                    + state.momentum.clone().mul(state.precond.clone()).mul_scalar(eps))
                .detach();
                let (_, grad_new) = self.potential_and_grad(&state.theta, batch)?;
                state.momentum = state.momentum.clone() - grad_new.clone().mul_scalar(half);
                state.grad = Some(grad_new);
            }
        }
        state.momentum = state.momentum.clone().detach();
        Ok(u)
    }

    /// Partial momentum refresh keeping `p ~ N(0, T / P)` invariant.
    fn refresh(&self, state: &mut State<B>, temperature: f64, dim: usize) {
        let a = self.hyper.momentum;
        let scale = ((1.0 - a * a) * temperature).sqrt();
        let noise = self.noise(dim).div(state.precond.clone().sqrt()).mul_scalar(scale);
        state.momentum = state.momentum.clone().mul_scalar(a) + noise;
    }

    fn energy(&self, state: &State<B>) -> Result<f64, RunnerError> {
        let kinetic = state
            .momentum
            .clone()
            .powf_scalar(2.0)
            .mul(state.precond.clone())
            .sum()
            .into_scalar()
            .to_f64()
            * 0.5;
        Ok(self.full_potential(&state.theta)? + kinetic)
    }

    fn refresh_preconditioner(&self, state: &mut State<B>, moments: &mut RunningMoments) {
        if moments.count() == 0 {
            return;
        }
        let precond = moments.mean_sq().mapv(|ms| 1.0 / (ms.sqrt() + PRECOND_EPS));
        let mean = precond.mean().unwrap_or(1.0);
        let values: Vec<f32> = precond.iter().map(|p| (p / mean) as f32).collect();
        let dim = values.len();
        state.precond = Tensor::from_data(TensorData::new(values, [dim]), &self.device());
        moments.reset();
    }

    fn record(&mut self, name: &str, value: f64) -> Result<(), RunnerError> {
        Ok(self.metrics.add_scalar(name, self.step, value)?)
    }

    fn keep_sample(&mut self, state: &State<B>) -> Result<(), RunnerError> {
        let store = self.model.layout().store_from_tensor(state.theta.clone())?;
        // The update that produced this state has not been checked yet.
        let test_ll = self.finite(self.test_log_likelihood(&state.theta)?)?;
        self.record("test_log_likelihood", test_ll)?;
        self.sample_sink.add_sample(self.step, &store)?;
        self.samples.push(store);
        Ok(())
    }
}

impl<B: AutodiffBackend, M: PosteriorModel<B>> SamplingRunner for CyclicRunner<'_, B, M> {
    fn run(&mut self, progressbar: bool) -> Result<(), RunnerError> {
        let schedule = self.schedule;
        let hyper = self.hyper;
        let device = self.device();
        let theta = self.model.params();
        let dim = theta.dims()[0];
        let mut state = State {
            theta,
            momentum: Tensor::<B, 1>::zeros([dim], &device),
            precond: Tensor::<B, 1>::ones([dim], &device),
            grad: None,
        };
        let mut moments = RunningMoments::new(dim);
        let batches_per_epoch = self.train.len();
        let steps_per_cycle = (schedule.epochs_per_cycle * batches_per_epoch).max(1);
        let mut epoch_total = 0usize;
        let mut sampling_epochs = 0usize;

        let pb = if progressbar {
            Some(progress_bar(
                schedule.total_epochs() as u64,
                self.variant.name(),
            )?)
        } else {
            None
        };

        for cycle in 0..schedule.cycles {
            for epoch in 0..schedule.epochs_per_cycle {
                let phase = schedule.phase(epoch);
                let temperature = match phase {
                    Phase::Warmup => 0.0,
                    Phase::Burnin | Phase::Sampling => hyper.temperature,
                };
                let before = if self.variant.rejection {
                    let mut start = state.clone();
                    // The kinetic term needs a fresh momentum draw.
                    self.refresh(&mut start, temperature, dim);
                    state.momentum = start.momentum.clone();
                    Some((self.energy(&start)?, start))
                } else {
                    None
                };

                let batches: Vec<Batch> = self.train.epoch().collect::<Result<_, _>>()?;
                let mut last_u = f64::NAN;
                for (i, batch) in batches.iter().enumerate() {
                    let progress = (epoch * batches_per_epoch + i) as f64 / steps_per_cycle as f64;
                    let lr = hyper.sampling_decay.step_size(hyper.lr, progress);
                    last_u = self.update(&mut state, batch, lr, temperature, &mut moments)?;
                    if self.step % hyper.metrics_skip as u64 == 0 {
                        self.record("lr", lr)?;
                        self.record("temperature", temperature)?;
                        self.record("potential", last_u)?;
                    }
                    self.step += 1;
                }

                if let Some((h_old, start)) = before {
                    let h_new = self.energy(&state)?;
                    let accept_prob = acceptance_probability(h_old, h_new, temperature);
                    let accepted = self.rng.gen::<f64>() < accept_prob;
                    self.acceptance.push(accepted);
                    self.record("acceptance_prob", accept_prob)?;
                    if !accepted && hyper.reject_samples {
                        state = start;
                        state.momentum = state.momentum.clone().neg();
                        state.grad = None;
                    }
                }

                epoch_total += 1;
                if let Some(every) = hyper.precond_update {
                    if epoch_total % every == 0 {
                        self.refresh_preconditioner(&mut state, &mut moments);
                        state.grad = None;
                    }
                }

                if phase == Phase::Sampling {
                    sampling_epochs += 1;
                    if sampling_epochs % hyper.skip == 0 {
                        self.keep_sample(&state)?;
                    }
                }

                debug!(
                    cycle,
                    epoch,
                    ?phase,
                    potential = last_u,
                    samples = self.samples.len(),
                    "epoch finished"
                );
                if let Some(pb) = &pb {
                    pb.inc(1);
                    let accept = self
                        .acceptance
                        .rate()
                        .map_or(String::new(), |r| format!("p(accept)≈{r:.2} "));
                    pb.set_message(format!("{accept}U≈{last_u:.3e} samples={}", self.samples.len()));
                }
            }
        }
        if let Some(pb) = pb {
            pb.finish_with_message("Done!");
        }

        self.finite(self.full_potential(&state.theta)?)?;
        self.model.set_params(state.theta);
        Ok(())
    }

    fn get_samples(&self) -> &[ParamStore] {
        &self.samples
    }
}

/// `min(1, exp(-(h_new - h_old) / T))`; every proposal is accepted at zero temperature.
pub fn acceptance_probability(h_old: f64, h_new: f64, temperature: f64) -> f64 {
    if temperature == 0.0 {
        return 1.0;
    }
    let log_ratio = -(h_new - h_old) / temperature;
    if log_ratio.is_nan() {
        0.0
    } else {
        log_ratio.min(0.0).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;
    use crate::data::{DatasetProvider, ToyDatasets};
    use crate::error::SinkError;
    use crate::model::{get_model, DenseNet, ModelSpec};
    use crate::prior::{Prior, PriorFamily};
    use crate::sinks::Sink;
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use std::sync::Arc;

    type B = Autodiff<NdArray>;

    #[derive(Default)]
    struct Recorder {
        scalars: Vec<(String, u64, f64)>,
        samples: Vec<u64>,
    }

    impl Sink for Recorder {
        fn flush(&mut self) -> Result<(), SinkError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    impl MetricsSink for Recorder {
        fn add_scalar(&mut self, name: &str, step: u64, value: f64) -> Result<(), SinkError> {
            self.scalars.push((name.to_string(), step, value));
            Ok(())
        }
    }

    impl SampleSink for Recorder {
        fn add_sample(&mut self, step: u64, _: &ParamStore) -> Result<(), SinkError> {
            self.samples.push(step);
            Ok(())
        }
    }

    fn hyper(lr: f64) -> CyclicHyper {
        CyclicHyper {
            lr,
            skip: 2,
            metrics_skip: 1,
            sampling_decay: SamplingDecay::Cosine,
            temperature: 1.0,
            momentum: 0.9,
            precond_update: Some(1),
            reject_samples: true,
            seed: 0,
        }
    }

    fn setup() -> (DenseNet<B>, DataLoader, DataLoader) {
        B::seed(0);
        let dataset = ToyDatasets::new(20, 8, 0).dataset("toy_regression").unwrap();
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
        let model = get_model::<B>(ModelKind::DenseNet, spec, &NdArrayDevice::Cpu, &mut rng).unwrap();
        let train = DataLoader::new(Arc::clone(&dataset.train), 10, true, 0, 0).unwrap();
        let test = DataLoader::new(Arc::clone(&dataset.test), 10, false, 0, 0).unwrap();
        (model, train, test)
    }

    fn run_variant(
        variant: CyclicVariant,
        lr: f64,
        metrics: &mut Recorder,
        saved: &mut Recorder,
    ) -> Result<usize, RunnerError> {
        let (mut model, train, test) = setup();
        let schedule = Schedule::compute(6, 2, 3, 1, 1).unwrap();
        let mut runner = CyclicRunner::new(
            &mut model, train, test, schedule, hyper(lr), variant, metrics, saved,
        );
        runner.run(false)?;
        Ok(runner.get_samples().len())
    }

    #[test]
    fn test_every_variant_collects_exact_sample_count() {
        for (integrator, rejection) in [
            (Integrator::Langevin, false),
            (Integrator::Verlet, false),
            (Integrator::Momentum, false),
            (Integrator::Momentum, true),
            (Integrator::Verlet, true),
        ] {
            let variant = CyclicVariant {
                integrator,
                rejection,
            };
            let mut metrics = Recorder::default();
            let mut saved = Recorder::default();
            let n = run_variant(variant, 1e-3, &mut metrics, &mut saved).unwrap();
            assert_eq!(n, 6, "{}", variant.name());
            assert_eq!(saved.samples.len(), 6);
            let tests = metrics
                .scalars
                .iter()
                .filter(|(name, ..)| name == "test_log_likelihood")
                .count();
            assert_eq!(tests, 6);
            let acceptances = metrics
                .scalars
                .iter()
                .filter(|(name, ..)| name == "acceptance_prob")
                .count();
            // One test per epoch: 3 cycles of 1 + 1 + 4 epochs.
            assert_eq!(acceptances, if rejection { 18 } else { 0 });
        }
    }

    #[test]
    fn test_warmup_runs_cold_with_restarting_step_size() {
        let mut metrics = Recorder::default();
        let mut saved = Recorder::default();
        let variant = CyclicVariant {
            integrator: Integrator::Langevin,
            rejection: false,
        };
        run_variant(variant, 1e-3, &mut metrics, &mut saved).unwrap();
        let series = |key: &str| -> Vec<f64> {
            metrics
                .scalars
                .iter()
                .filter(|(name, ..)| name == key)
                .map(|(_, _, v)| *v)
                .collect()
        };
        let temperatures = series("temperature");
        let lrs = series("lr");
        // 2 batches per epoch, 6 epochs per cycle; the first epoch of each cycle is warmup.
        assert_eq!(temperatures.len(), 36);
        for cycle in 0..3 {
            let start = cycle * 12;
            assert_eq!(&temperatures[start..start + 2], &[0.0, 0.0]);
            assert!(temperatures[start + 2..start + 12].iter().all(|&t| t == 1.0));
            assert_eq!(lrs[start], 1e-3);
            assert!(lrs[start + 11] < lrs[start + 1]);
        }
        // Samples are taken at the last step of every second sampling epoch.
        assert_eq!(saved.samples.len(), 6);
        assert!(saved.samples.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_divergence_is_reported() {
        let mut metrics = Recorder::default();
        let mut saved = Recorder::default();
        let variant = CyclicVariant {
            integrator: Integrator::Langevin,
            rejection: false,
        };
        let result = run_variant(variant, 1e30, &mut metrics, &mut saved);
        assert!(matches!(result, Err(RunnerError::NonFinite { .. })), "{result:?}");
    }

    #[test]
    fn test_divergence_on_final_step_is_reported() {
        let (mut model, _, test) = setup();
        let dataset = ToyDatasets::new(20, 8, 0).dataset("toy_regression").unwrap();
        let train = DataLoader::new(Arc::clone(&dataset.train), 20, false, 0, 0).unwrap();
        let schedule = Schedule::compute(1, 1, 1, 0, 0).unwrap();
        let mut metrics = Recorder::default();
        let mut saved = Recorder::default();
        let variant = CyclicVariant {
            integrator: Integrator::Langevin,
            rejection: false,
        };
        let mut runner = CyclicRunner::new(
            &mut model,
            train,
            test,
            schedule,
            hyper(1e30),
            variant,
            &mut metrics,
            &mut saved,
        );
        let result = runner.run(false);
        assert!(matches!(result, Err(RunnerError::NonFinite { step: 1, .. })), "{result:?}");
        assert!(runner.get_samples().is_empty());
        drop(runner);
        assert!(saved.samples.is_empty());
        assert!(metrics.scalars.iter().all(|(name, ..)| name != "test_log_likelihood"));
    }

    #[test]
    fn test_acceptance_probability() {
        assert_eq!(acceptance_probability(1.0, 0.5, 1.0), 1.0);
        approx::assert_abs_diff_eq!(
            acceptance_probability(0.0, 2.0, 2.0),
            (-1.0f64).exp(),
            epsilon = 1e-12
        );
        assert_eq!(acceptance_probability(0.0, 1e9, 0.0), 1.0);
        assert_eq!(acceptance_probability(0.0, f64::NAN, 1.0), 0.0);
    }
}

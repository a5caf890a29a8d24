/*!
# Posterior models

A [`PosteriorModel`] owns a flat parameter vector and knows how to score it: a log prior over
the parameters and a per-point log likelihood of a batch. Everything a sampler needs follows
from those two, most importantly the potential energy

```text
U(theta) = -(N / n * sum_i log p(y_i | x_i, theta) + log p(theta))
```

for a batch of `n` points out of a dataset of `N`.

The only architecture is [`DenseNet`], a fully connected ReLU network whose parameters are
named `layers.{i}.weight` (shape `[in, out]`) and `layers.{i}.bias` (shape `[out]`).
*/

use burn::prelude::*;
use burn::tensor::activation::{log_softmax, relu, softmax};
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::config::{InitMethod, ModelKind, RunConfig};
use crate::data::{DataSource, Dataset, Task};
use crate::error::{CheckpointError, ConfigError, RunnerError};
use crate::params::{ParamLayout, ParamRole, ParamSpec, ParamStore};
use crate::prior::{Prior, PriorFamily};

/// A Bayesian model over a flat parameter vector.
pub trait PosteriorModel<B: AutodiffBackend> {
    fn layout(&self) -> &ParamLayout;

    fn device(&self) -> &B::Device;

    fn task(&self) -> Task;

    /// Current parameters as a flat `[numel]` tensor.
    fn params(&self) -> Tensor<B, 1>;

    fn set_params(&mut self, theta: Tensor<B, 1>);

    /// `log p(theta)` as a one-element tensor.
    fn log_prior(&self, theta: &Tensor<B, 1>) -> Tensor<B, 1>;

    /// `log p(y_i | x_i, theta)` for each row, shape `[n]`.
    fn log_likelihood(&self, theta: &Tensor<B, 1>, x: Tensor<B, 2>, y: Tensor<B, 2>)
        -> Tensor<B, 1>;

    /// Raw network outputs, shape `[n, outputs]`.
    fn forward(&self, theta: &Tensor<B, 1>, x: Tensor<B, 2>) -> Tensor<B, 2>;

    /// Predictive mean for regression, class probabilities for classification.
    fn predict(&self, theta: &Tensor<B, 1>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let out = self.forward(theta, x);
        match self.task() {
            Task::Regression => out,
            Task::Classification { .. } => softmax(out, 1),
        }
    }

    /// Applies an initialization scheme to the current parameters.
    fn initialize(&mut self, method: InitMethod, rng: &mut SmallRng) -> Result<(), ConfigError>;

    /// Replaces every parameter by a draw from its prior.
    fn sample_all_priors(&mut self, rng: &mut SmallRng) -> Result<(), ConfigError>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn eval(&mut self) {
        self.set_training(false);
    }

    /// Potential energy of `theta` on a batch, scaled as if the batch were `num_data` points.
    fn potential(
        &self,
        theta: &Tensor<B, 1>,
        x: Tensor<B, 2>,
        y: Tensor<B, 2>,
        num_data: usize,
    ) -> Tensor<B, 1> {
        let n = x.dims()[0];
        let scale = num_data as f64 / n as f64;
        let log_lik = self.log_likelihood(theta, x, y).sum().mul_scalar(scale);
        (log_lik + self.log_prior(theta)).neg()
    }

    fn state_dict(&self) -> Result<ParamStore, RunnerError> {
        self.layout().store_from_tensor(self.params())
    }

    fn load_state_dict(&mut self, store: &ParamStore) -> Result<(), CheckpointError> {
        let theta = self.layout().tensor_from_store::<B>(store, self.device())?;
        self.set_params(theta);
        Ok(())
    }
}

/// Everything needed to build a model for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub n_features: usize,
    pub n_outputs: usize,
    pub task: Task,
    pub width: usize,
    pub depth: usize,
    pub weight_prior: Prior,
    pub bias_prior: Prior,
    /// Observation noise of the Gaussian likelihood.
    pub noise_std: f64,
}

impl ModelSpec {
    pub fn from_config(config: &RunConfig, dataset: &Dataset) -> Self {
        Self {
            n_features: dataset.train.n_features(),
            n_outputs: dataset.train.n_targets(),
            task: dataset.task,
            width: config.width,
            depth: config.depth,
            weight_prior: Prior::new(config.weight_prior, config.weight_loc, config.weight_scale),
            bias_prior: Prior::new(config.bias_prior, config.bias_loc, config.bias_scale),
            noise_std: config.noise_std,
        }
    }

    pub fn with_weight_prior(mut self, family: PriorFamily) -> Self {
        self.weight_prior.family = family;
        self
    }
}

/// Builds the model named by `kind`.
pub fn get_model<B: AutodiffBackend>(
    kind: ModelKind,
    spec: ModelSpec,
    device: &B::Device,
    rng: &mut SmallRng,
) -> Result<DenseNet<B>, ConfigError> {
    match kind {
        ModelKind::DenseNet => DenseNet::new(spec, device, rng),
    }
}

/// Fully connected ReLU network.
#[derive(Debug, Clone)]
pub struct DenseNet<B: Backend> {
    spec: ModelSpec,
    layout: ParamLayout,
    layers: Vec<(ParamSpec, ParamSpec)>,
    theta: Tensor<B, 1>,
    device: B::Device,
    training: bool,
}

impl<B: AutodiffBackend> DenseNet<B> {
    /// Builds the network with parameters drawn from the priors, or with He initialization when
    /// a prior is improper.
    pub fn new(spec: ModelSpec, device: &B::Device, rng: &mut SmallRng) -> Result<Self, ConfigError> {
        if spec.depth == 0 || spec.width == 0 {
            return Err(ConfigError::NonPositive {
                field: if spec.depth == 0 { "depth" } else { "width" },
                value: "0".to_string(),
            });
        }
        let mut layout = ParamLayout::new();
        let mut layers = Vec::with_capacity(spec.depth);
        for i in 0..spec.depth {
            let fan_in = if i == 0 { spec.n_features } else { spec.width };
            let fan_out = if i + 1 == spec.depth {
                spec.n_outputs
            } else {
                spec.width
            };
            let weight = layout
                .push(
                    format!("layers.{i}.weight"),
                    vec![fan_in, fan_out],
                    ParamRole::Weight { fan_in },
                )
                .clone();
            let bias = layout
                .push(
                    format!("layers.{i}.bias"),
                    vec![fan_out],
                    ParamRole::Bias { fan_in },
                )
                .clone();
            layers.push((weight, bias));
        }
        let theta = Tensor::<B, 1>::zeros([layout.numel()], device);
        let mut model = Self {
            spec,
            layout,
            layers,
            theta,
            device: device.clone(),
            training: true,
        };
        let sampleable = [spec.weight_prior, spec.bias_prior]
            .iter()
            .all(|p| p.family != PriorFamily::Improper);
        if sampleable {
            model.sample_all_priors(rng)?;
        } else {
            model.initialize(InitMethod::He, rng)?;
        }
        Ok(model)
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prior_for(&self, role: ParamRole) -> &Prior {
        match role {
            ParamRole::Weight { .. } => &self.spec.weight_prior,
            ParamRole::Bias { .. } => &self.spec.bias_prior,
        }
    }

    /// Fills every parameter from `draw(spec, rng)` and installs the result.
    fn fill_with<F>(&mut self, rng: &mut SmallRng, mut draw: F) -> Result<(), ConfigError>
    where
        F: FnMut(&ParamSpec, &mut SmallRng) -> Result<Vec<f32>, ConfigError>,
    {
        let mut flat = Vec::with_capacity(self.layout.numel());
        for spec in self.layout.specs() {
            flat.extend(draw(spec, rng)?);
        }
        self.theta = Tensor::from_data(TensorData::new(flat, [self.layout.numel()]), &self.device);
        Ok(())
    }

    fn slice(&self, theta: &Tensor<B, 1>, spec: &ParamSpec) -> Tensor<B, 1> {
        theta.clone().slice([spec.range()])
    }
}

impl<B: AutodiffBackend> PosteriorModel<B> for DenseNet<B> {
    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn device(&self) -> &B::Device {
        &self.device
    }

    fn task(&self) -> Task {
        self.spec.task
    }

    fn params(&self) -> Tensor<B, 1> {
        self.theta.clone()
    }

    fn set_params(&mut self, theta: Tensor<B, 1>) {
        self.theta = theta.detach();
    }

    fn log_prior(&self, theta: &Tensor<B, 1>) -> Tensor<B, 1> {
        let mut total = Tensor::<B, 1>::zeros([1], &self.device);
        for spec in self.layout.specs() {
            let prior = self.prior_for(spec.role);
            total = total + prior.log_prob(self.slice(theta, spec));
        }
        total
    }

    fn log_likelihood(
        &self,
        theta: &Tensor<B, 1>,
        x: Tensor<B, 2>,
        y: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let out = self.forward(theta, x);
        match self.spec.task {
            Task::Regression => {
                let sigma = self.spec.noise_std;
                let k = self.spec.n_outputs as f64;
                let norm = k * (sigma.ln() + 0.5 * (2.0 * std::f64::consts::PI).ln());
                (y - out)
                    .powf_scalar(2.0)
                    .sum_dim(1)
                    .squeeze::<1>(1)
                    .div_scalar(-2.0 * sigma * sigma)
                    .sub_scalar(norm)
            }
            Task::Classification { .. } => (log_softmax(out, 1) * y).sum_dim(1).squeeze::<1>(1),
        }
    }

    fn forward(&self, theta: &Tensor<B, 1>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len() - 1;
        let mut h = x;
        for (i, (weight, bias)) in self.layers.iter().enumerate() {
            let w = self
                .slice(theta, weight)
                .reshape(Shape::new([weight.shape[0], weight.shape[1]]));
            let b = self.slice(theta, bias).reshape(Shape::new([1, bias.shape[0]]));
            h = h.matmul(w) + b;
            if i < last {
                h = relu(h);
            }
        }
        h
    }

    fn initialize(&mut self, method: InitMethod, rng: &mut SmallRng) -> Result<(), ConfigError> {
        let invalid = |e: rand_distr::NormalError| ConfigError::Parse(e.to_string());
        match method {
            InitMethod::Prior => Ok(()),
            InitMethod::He => self.fill_with(rng, |spec, rng| {
                let fan_in = fan_in(spec.role);
                let normal = Normal::new(0.0, (2.0 / fan_in).sqrt()).map_err(invalid)?;
                Ok(draw_n(spec.numel(), &normal, rng))
            }),
            InitMethod::HeZeroBias => self.fill_with(rng, |spec, rng| match spec.role {
                ParamRole::Bias { .. } => Ok(vec![0.0; spec.numel()]),
                ParamRole::Weight { fan_in } => {
                    let normal =
                        Normal::new(0.0, (2.0 / fan_in.max(1) as f64).sqrt()).map_err(invalid)?;
                    Ok(draw_n(spec.numel(), &normal, rng))
                }
            }),
            InitMethod::HeUniform => self.fill_with(rng, |spec, rng| {
                let fan_in = fan_in(spec.role);
                let bound = match spec.role {
                    ParamRole::Weight { .. } => (6.0 / fan_in).sqrt(),
                    ParamRole::Bias { .. } => 1.0 / fan_in.sqrt(),
                };
                let uniform = Uniform::new_inclusive(-bound, bound);
                Ok(draw_n(spec.numel(), &uniform, rng))
            }),
        }
    }

    fn sample_all_priors(&mut self, rng: &mut SmallRng) -> Result<(), ConfigError> {
        let weight_prior = self.spec.weight_prior;
        let bias_prior = self.spec.bias_prior;
        self.fill_with(rng, |spec, rng| match spec.role {
            ParamRole::Weight { .. } => weight_prior.sample(spec.numel(), rng),
            ParamRole::Bias { .. } => bias_prior.sample(spec.numel(), rng),
        })
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

fn fan_in(role: ParamRole) -> f64 {
    match role {
        ParamRole::Weight { fan_in } | ParamRole::Bias { fan_in } => fan_in.max(1) as f64,
    }
}

fn draw_n<D: Distribution<f64>>(n: usize, dist: &D, rng: &mut SmallRng) -> Vec<f32> {
    (0..n).map(|_| dist.sample(rng) as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamTensor;
    use approx::assert_abs_diff_eq;
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use burn::tensor::cast::ToElement;
    use rand::SeedableRng;

    type B = Autodiff<NdArray>;

    fn spec(task: Task, n_outputs: usize) -> ModelSpec {
        ModelSpec {
            n_features: 2,
            n_outputs,
            task,
            width: 4,
            depth: 2,
            weight_prior: Prior::new(PriorFamily::Gaussian, 0.0, 1.0),
            bias_prior: Prior::new(PriorFamily::Gaussian, 0.0, 1.0),
            noise_std: 0.5,
        }
    }

    fn model(task: Task, n_outputs: usize) -> DenseNet<B> {
        let mut rng = SmallRng::seed_from_u64(0);
        get_model(ModelKind::DenseNet, spec(task, n_outputs), &NdArrayDevice::Cpu, &mut rng).unwrap()
    }

    #[test]
    fn test_parameter_names_and_shapes() {
        let net = model(Task::Regression, 1);
        let names: Vec<&str> = net.layout().specs().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["layers.0.weight", "layers.0.bias", "layers.1.weight", "layers.1.bias"]
        );
        assert_eq!(net.layout().numel(), 2 * 4 + 4 + 4 + 1);
        let state = net.state_dict().unwrap();
        assert_eq!(state.get("layers.1.weight").unwrap().shape, vec![4, 1]);
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut net = model(Task::Regression, 1);
        let mut state = net.state_dict().unwrap();
        state.insert("layers.1.bias", ParamTensor::new(vec![1], vec![3.5]));
        net.load_state_dict(&state).unwrap();
        assert_eq!(net.state_dict().unwrap(), state);
    }

    #[test]
    fn test_forward_of_zero_network_is_bias() {
        let mut net = model(Task::Regression, 1);
        let mut state = net.state_dict().unwrap();
        for (name, value) in state.clone().iter() {
            state.insert(name, ParamTensor::zeros(value.shape.clone()));
        }
        state.insert("layers.1.bias", ParamTensor::new(vec![1], vec![0.25]));
        net.load_state_dict(&state).unwrap();
        let x = Tensor::<B, 2>::from_floats([[1.0, 2.0], [3.0, -1.0]], &NdArrayDevice::Cpu);
        let out = net.forward(&net.params(), x);
        assert_eq!(out.into_data().to_vec::<f32>().unwrap(), vec![0.25, 0.25]);
    }

    #[test]
    fn test_gaussian_log_likelihood() {
        let mut net = model(Task::Regression, 1);
        let zeros: ParamStore = net
            .layout()
            .specs()
            .iter()
            .map(|s| (s.name.clone(), ParamTensor::zeros(s.shape.clone())))
            .collect();
        net.load_state_dict(&zeros).unwrap();
        let device = NdArrayDevice::Cpu;
        let x = Tensor::<B, 2>::zeros([1, 2], &device);
        let y = Tensor::<B, 2>::from_floats([[1.0]], &device);
        let ll = net
            .log_likelihood(&net.params(), x, y)
            .into_scalar()
            .to_f64();
        let sigma: f64 = 0.5;
        let expected =
            -0.5 / (sigma * sigma) - sigma.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln();
        assert_abs_diff_eq!(ll, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_classification_probabilities_sum_to_one() {
        let net = model(Task::Classification { n_classes: 3 }, 3);
        let x = Tensor::<B, 2>::from_floats([[0.3, -0.2], [1.0, 1.0]], &NdArrayDevice::Cpu);
        let probs = net.predict(&net.params(), x);
        let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for s in sums {
            assert_abs_diff_eq!(s, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_potential_has_gradient() {
        let net = model(Task::Regression, 1);
        let device = NdArrayDevice::Cpu;
        let theta = net.params().require_grad();
        let x = Tensor::<B, 2>::from_floats([[0.1, 0.2], [0.3, 0.4]], &device);
        let y = Tensor::<B, 2>::from_floats([[1.0], [0.0]], &device);
        let u = net.potential(&theta, x, y, 100);
        let grads = u.backward();
        let grad = theta.grad(&grads).expect("gradient w.r.t. theta");
        assert_eq!(grad.dims(), [net.layout().numel()]);
    }

    #[test]
    fn test_init_schemes() {
        let mut net = model(Task::Regression, 1);
        let mut rng = SmallRng::seed_from_u64(5);
        net.initialize(InitMethod::HeZeroBias, &mut rng).unwrap();
        let state = net.state_dict().unwrap();
        assert!(state.get("layers.0.bias").unwrap().values.iter().all(|&v| v == 0.0));
        assert!(state.get("layers.0.weight").unwrap().values.iter().any(|&v| v != 0.0));

        net.initialize(InitMethod::HeUniform, &mut rng).unwrap();
        let bound = (6.0f32 / 2.0).sqrt();
        let state = net.state_dict().unwrap();
        assert!(state
            .get("layers.0.weight")
            .unwrap()
            .values
            .iter()
            .all(|v| v.abs() <= bound));

        let before = net.state_dict().unwrap();
        net.initialize(InitMethod::Prior, &mut rng).unwrap();
        assert_eq!(net.state_dict().unwrap(), before);
    }

    #[test]
    fn test_improper_prior_falls_back_to_he() {
        let mut rng = SmallRng::seed_from_u64(1);
        let spec = spec(Task::Regression, 1).with_weight_prior(PriorFamily::Improper);
        let mut net = DenseNet::<B>::new(spec, &NdArrayDevice::Cpu, &mut rng).unwrap();
        assert!(matches!(
            net.sample_all_priors(&mut rng),
            Err(ConfigError::UnsampleablePrior(_))
        ));
        let lp = net.log_prior(&net.params()).into_scalar().to_f64();
        assert!(lp.is_finite());
    }
}

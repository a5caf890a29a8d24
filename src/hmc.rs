//! Hamiltonian Monte Carlo over a flat parameter vector, using the `burn` crate for autodiff.
//!
//! The target is given as a potential energy `U(theta) = -log p(theta | data)` through the
//! [`PotentialTarget`] trait. Each step draws a fresh momentum, simulates the dynamics with
//! the leapfrog integrator, and accepts or rejects the end point with the usual Metropolis
//! test on the Hamiltonian `H = U(theta) + |p|^2 / 2`. Step size and number of leapfrog steps
//! are fixed; there is no adaptation.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use rand::prelude::*;

use crate::error::RunnerError;

/// A target distribution given by its potential energy.
pub trait PotentialTarget<B: AutodiffBackend> {
    /// `U(theta)` as a one-element tensor that can be differentiated with respect to `theta`.
    fn potential(&self, theta: &Tensor<B, 1>) -> Tensor<B, 1>;
}

/// Outcome of a single HMC step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub accepted: bool,
    /// `min(1, exp(H_current - H_proposed))`, zero for a diverging proposal.
    pub accept_prob: f64,
    /// Potential at the position after the step.
    pub potential: f64,
}

/// Single-chain HMC sampler.
#[derive(Debug, Clone)]
pub struct HMC<B, Target>
where
    B: AutodiffBackend,
{
    /// The target distribution which provides potential evaluations and gradients.
    pub target: Target,
    /// The step size for the leapfrog integrator.
    pub step_size: f64,
    /// The number of leapfrog steps to take per HMC update.
    pub n_leapfrog: usize,
    position: Tensor<B, 1>,
    /// Potential and its gradient at `position`.
    current: Option<(f64, Tensor<B, 1>)>,
    n_steps: u64,
    rng: SmallRng,
}

impl<B, Target> HMC<B, Target>
where
    B: AutodiffBackend,
    Target: PotentialTarget<B>,
{
    pub fn new(target: Target, initial_position: Tensor<B, 1>, step_size: f64, n_leapfrog: usize) -> Self {
        Self {
            target,
            step_size,
            n_leapfrog,
            position: initial_position.detach(),
            current: None,
            n_steps: 0,
            rng: SmallRng::seed_from_u64(thread_rng().gen::<u64>()),
        }
    }

    /// Sets a new random seed.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn position(&self) -> &Tensor<B, 1> {
        &self.position
    }

    /// Performs one HMC update of the position.
    ///
    /// A non-finite potential at the current position is an error. A proposal that diverges
    /// is rejected like any other.
    pub fn step(&mut self) -> Result<Transition, RunnerError> {
        let (u_current, grad_current) = match self.current.take() {
            Some(cached) => cached,
            None => self.potential_and_grad(self.position.clone())?,
        };
        if !u_current.is_finite() {
            return Err(RunnerError::NonFinite {
                step: self.n_steps,
                value: u_current,
            });
        }
        self.n_steps += 1;

        let dim = self.position.dims()[0];
        let device = self.position.device();
        let momentum = Tensor::<B, 1>::random(
            Shape::new([dim]),
            burn::tensor::Distribution::Normal(0., 1.),
            &device,
        );
        let h_current = u_current + kinetic(&momentum);

        let (position, momentum, u_proposed, grad_proposed) =
            self.leapfrog(self.position.clone(), momentum, grad_current.clone())?;
        let h_proposed = u_proposed + kinetic(&momentum);

        let log_accept = h_current - h_proposed;
        let accept_prob = if log_accept.is_finite() {
            log_accept.min(0.0).exp()
        } else {
            0.0
        };
        let ln_u = self.rng.gen::<f64>().ln();
        if log_accept.is_finite() && log_accept >= ln_u {
            self.position = position;
            self.current = Some((u_proposed, grad_proposed));
            Ok(Transition {
                accepted: true,
                accept_prob,
                potential: u_proposed,
            })
        } else {
            self.current = Some((u_current, grad_current));
            Ok(Transition {
                accepted: false,
                accept_prob,
                potential: u_current,
            })
        }
    }

    /// `n_leapfrog` iterations of: half-step momentum, full-step position, half-step momentum.
    /// Returns the end point, its momentum, and the potential and gradient there.
    #[allow(clippy::type_complexity)]
    fn leapfrog(
        &self,
        mut pos: Tensor<B, 1>,
        mut mom: Tensor<B, 1>,
        mut grad: Tensor<B, 1>,
    ) -> Result<(Tensor<B, 1>, Tensor<B, 1>, f64, Tensor<B, 1>), RunnerError> {
        let half = 0.5 * self.step_size;
        let mut u = f64::NAN;
        for _ in 0..self.n_leapfrog {
            mom = mom - grad.mul_scalar(half);
            pos = (pos + mom.clone().mul_scalar(self.step_size)).detach();
            let (u_new, grad_new) = self.potential_and_grad(pos.clone())?;
            u = u_new;
            grad = grad_new;
            mom = mom - grad.clone().mul_scalar(half);
            if !u.is_finite() {
                break;
            }
        }
        Ok((pos, mom.detach(), u, grad))
    }

    fn potential_and_grad(&self, pos: Tensor<B, 1>) -> Result<(f64, Tensor<B, 1>), RunnerError> {
        let pos = pos.detach().require_grad();
        let u = self.target.potential(&pos);
        let value = u.clone().into_scalar().to_f64();
        let grads = u.backward();
        let grad = pos.grad(&grads).ok_or(RunnerError::MissingGradient)?;
        Ok((value, Tensor::<B, 1>::from_inner(grad)))
    }
}

fn kinetic<B: Backend>(momentum: &Tensor<B, 1>) -> f64 {
    momentum
        .clone()
        .powf_scalar(2.0)
        .sum()
        .mul_scalar(0.5)
        .into_scalar()
        .to_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::RunningMoments;
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};

    type B = Autodiff<NdArray>;

    /// Isotropic Gaussian centered at `mean`.
    struct Gaussian {
        mean: f32,
    }

    impl<B: AutodiffBackend> PotentialTarget<B> for Gaussian {
        fn potential(&self, theta: &Tensor<B, 1>) -> Tensor<B, 1> {
            theta
                .clone()
                .sub_scalar(self.mean)
                .powf_scalar(2.0)
                .sum()
                .mul_scalar(0.5)
        }
    }

    struct Exploding;

    impl<B: AutodiffBackend> PotentialTarget<B> for Exploding {
        fn potential(&self, theta: &Tensor<B, 1>) -> Tensor<B, 1> {
            theta.clone().sum().div_scalar(0.0)
        }
    }

    #[test]
    fn test_samples_gaussian_mean() {
        B::seed(42);
        let device = NdArrayDevice::Cpu;
        let init = Tensor::<B, 1>::zeros([2], &device);
        let mut sampler = HMC::new(Gaussian { mean: 1.5 }, init, 0.2, 10).set_seed(42);
        let mut moments = RunningMoments::new(2);
        let mut accepted = 0;
        for i in 0..600 {
            let transition = sampler.step().unwrap();
            accepted += transition.accepted as usize;
            if i >= 100 {
                let values = sampler.position().clone().into_data().to_vec::<f32>().unwrap();
                moments.push(&values);
            }
        }
        assert!(accepted > 400, "acceptance too low: {accepted}");
        for mean in moments.mean().iter() {
            assert!((mean - 1.5).abs() < 0.3, "mean {mean} too far from 1.5");
        }
    }

    #[test]
    fn test_non_finite_start_is_error() {
        let device = NdArrayDevice::Cpu;
        let init = Tensor::<B, 1>::ones([3], &device);
        let mut sampler = HMC::new(Exploding, init, 0.1, 4).set_seed(0);
        assert!(matches!(
            sampler.step(),
            Err(RunnerError::NonFinite { step: 0, .. })
        ));
    }
}

//! Parameter priors: log densities over burn tensors and draws with `rand_distr`.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Exp1, Normal};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PriorFamily {
    Gaussian,
    Laplace,
    /// Flat prior; contributes nothing to the potential and cannot be sampled.
    Improper,
}

impl PriorFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorFamily::Gaussian => "gaussian",
            PriorFamily::Laplace => "laplace",
            PriorFamily::Improper => "improper",
        }
    }
}

impl FromStr for PriorFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gaussian" => Ok(PriorFamily::Gaussian),
            "laplace" => Ok(PriorFamily::Laplace),
            "improper" => Ok(PriorFamily::Improper),
            other => Err(ConfigError::UnknownPrior(other.to_string())),
        }
    }
}

impl TryFrom<String> for PriorFamily {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PriorFamily> for String {
    fn from(value: PriorFamily) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for PriorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parameterized prior for one group of parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    pub family: PriorFamily,
    pub loc: f64,
    pub scale: f64,
}

impl Prior {
    pub fn new(family: PriorFamily, loc: f64, scale: f64) -> Self {
        Self { family, loc, scale }
    }

    /// Summed log density of every element of `values`, as a one-element tensor.
    pub fn log_prob<B: Backend>(&self, values: Tensor<B, 1>) -> Tensor<B, 1> {
        let n = values.dims()[0] as f64;
        match self.family {
            PriorFamily::Gaussian => {
                let z = values.sub_scalar(self.loc).div_scalar(self.scale);
                z.powf_scalar(2.0)
                    .sum()
                    .mul_scalar(-0.5)
                    .sub_scalar(n * (self.scale.ln() + 0.5 * (2.0 * PI).ln()))
            }
            PriorFamily::Laplace => values
                .sub_scalar(self.loc)
                .abs()
                .sum()
                .div_scalar(-self.scale)
                .sub_scalar(n * (2.0 * self.scale).ln()),
            PriorFamily::Improper => values.sum().mul_scalar(0.0),
        }
    }

    /// Draws `n` values from the prior.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Vec<f32>, ConfigError> {
        match self.family {
            PriorFamily::Gaussian => {
                let normal = Normal::new(self.loc, self.scale)
                    .map_err(|e| ConfigError::Parse(e.to_string()))?;
                Ok((0..n).map(|_| normal.sample(rng) as f32).collect())
            }
            PriorFamily::Laplace => Ok((0..n)
                .map(|_| {
                    // Difference of two Exp(1) draws is Laplace(0, 1).
                    let a: f64 = Exp1.sample(rng);
                    let b: f64 = Exp1.sample(rng);
                    (self.loc + self.scale * (a - b)) as f32
                })
                .collect()),
            PriorFamily::Improper => Err(ConfigError::UnsampleablePrior(
                self.family.as_str().to_string(),
            )),
        }
    }
}

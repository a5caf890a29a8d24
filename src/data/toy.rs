//! Small seeded datasets that are generated in memory.

use std::sync::Arc;

use ndarray::{Array2, Axis};
use rand::prelude::*;
use rand_distr::{Normal, Uniform};

use super::{Dataset, DatasetProvider, Task, TensorDataset};
use crate::error::DataError;

pub const TOY_REGRESSION: &str = "toy_regression";
pub const TOY_CLASSIFICATION: &str = "toy_classification";

const BLOB_CENTERS: [[f32; 2]; 3] = [[-2.0, 0.0], [2.0, 0.0], [0.0, 2.5]];

/// Provider for `toy_regression` (noisy sine, one feature) and `toy_classification`
/// (three Gaussian blobs in the plane). Features and regression targets are standardized with
/// statistics of the training split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyDatasets {
    pub n_train: usize,
    pub n_test: usize,
    pub seed: u64,
}

impl Default for ToyDatasets {
    fn default() -> Self {
        Self {
            n_train: 2000,
            n_test: 500,
            seed: 0,
        }
    }
}

impl ToyDatasets {
    pub fn new(n_train: usize, n_test: usize, seed: u64) -> Self {
        Self {
            n_train,
            n_test,
            seed,
        }
    }

    fn regression(&self, rng: &mut SmallRng) -> Result<Dataset, DataError> {
        let xs = Uniform::new(-3.0f32, 3.0);
        let noise = Normal::new(0.0f32, 0.1).map_err(|e| DataError::Shape(e.to_string()))?;
        let mut split = |n: usize| -> Result<TensorDataset, DataError> {
            let x: Vec<f32> = (0..n).map(|_| xs.sample(rng)).collect();
            let y: Vec<f32> = x.iter().map(|&v| v.sin() + noise.sample(rng)).collect();
            TensorDataset::new(column(x)?, column(y)?)
        };
        let mut train = split(self.n_train)?;
        let mut test = split(self.n_test)?;
        standardize(&mut train.x, &mut test.x);
        standardize(&mut train.y, &mut test.y);
        Ok(assemble(TOY_REGRESSION, train, test, Task::Regression))
    }

    fn classification(&self, rng: &mut SmallRng) -> Result<Dataset, DataError> {
        let n_classes = BLOB_CENTERS.len();
        let noise = Normal::new(0.0f32, 0.7).map_err(|e| DataError::Shape(e.to_string()))?;
        let mut split = |n: usize| -> Result<TensorDataset, DataError> {
            let mut x = Array2::<f32>::zeros((n, 2));
            let mut y = Array2::<f32>::zeros((n, n_classes));
            for i in 0..n {
                let label = rng.gen_range(0..n_classes);
                let center = BLOB_CENTERS[label];
                x[[i, 0]] = center[0] + noise.sample(rng);
                x[[i, 1]] = center[1] + noise.sample(rng);
                y[[i, label]] = 1.0;
            }
            TensorDataset::new(x, y)
        };
        let mut train = split(self.n_train)?;
        let mut test = split(self.n_test)?;
        standardize(&mut train.x, &mut test.x);
        Ok(assemble(
            TOY_CLASSIFICATION,
            train,
            test,
            Task::Classification { n_classes },
        ))
    }
}

fn assemble(name: &str, train: TensorDataset, test: TensorDataset, task: Task) -> Dataset {
    Dataset {
        name: name.to_string(),
        train: Arc::new(train),
        test: Arc::new(test),
        task,
    }
}

impl DatasetProvider for ToyDatasets {
    fn dataset(&self, name: &str) -> Result<Dataset, DataError> {
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let dataset = match name {
            TOY_REGRESSION => self.regression(&mut rng)?,
            TOY_CLASSIFICATION => self.classification(&mut rng)?,
            other => return Err(DataError::Unknown(other.to_string())),
        };
        dataset.check()?;
        Ok(dataset)
    }
}

fn column(values: Vec<f32>) -> Result<Array2<f32>, DataError> {
    let n = values.len();
    Array2::from_shape_vec((n, 1), values).map_err(|e| DataError::Shape(e.to_string()))
}

/// Centers and scales every column of `train` and `test` by the mean and standard deviation of
/// `train`. Constant columns are only centered.
pub fn standardize(train: &mut Array2<f32>, test: &mut Array2<f32>) {
    let Some(mean) = train.mean_axis(Axis(0)) else {
        return;
    };
    let std = train
        .std_axis(Axis(0), 0.0)
        .mapv(|s| if s > f32::EPSILON { s } else { 1.0 });
    for data in [train, test] {
        *data -= &mean;
        *data /= &std;
    }
}

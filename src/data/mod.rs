/*!
# Datasets and loaders

A [`Dataset`] is a pair of train/test [`DataSource`]s plus the [`Task`] they pose. Sources
either hold their data in memory as a [`TensorDataset`] or produce items on demand; the
orchestrator only cares about the difference when choosing loader workers (see
[`LoaderPlan`]).

Datasets are looked up by name through a [`DatasetProvider`]. Identifiers of the form
`synthetic.<name>.<prior>` ask for the named dataset with its labels regenerated by a network
drawn from `<prior>` (see [`synthetic`]).
*/

pub mod loader;
pub mod synthetic;
pub mod toy;

pub use loader::{Batch, DataLoader, LoaderPlan};
pub use synthetic::SyntheticData;
pub use toy::ToyDatasets;

use std::str::FromStr;
use std::sync::Arc;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DataError};
use crate::prior::PriorFamily;

/// Parsed form of the `data` config field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataId {
    Named(String),
    Synthetic { base: String, prior: PriorFamily },
}

impl DataId {
    /// Name of the dataset to load from the provider.
    pub fn base(&self) -> &str {
        match self {
            DataId::Named(name) => name,
            DataId::Synthetic { base, .. } => base,
        }
    }
}

impl FromStr for DataId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ConfigError::DataId(s.to_string());
        match s.strip_prefix("synthetic.") {
            Some(rest) => {
                let (base, prior) = rest.rsplit_once('.').ok_or_else(malformed)?;
                if base.is_empty() {
                    return Err(malformed());
                }
                Ok(DataId::Synthetic {
                    base: base.to_string(),
                    prior: prior.parse()?,
                })
            }
            None if s.is_empty() || s == "synthetic" => Err(malformed()),
            None => Ok(DataId::Named(s.to_string())),
        }
    }
}

/// What the labels mean, which decides the likelihood and evaluation metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Regression,
    /// Labels are one-hot rows of width `n_classes`.
    Classification { n_classes: usize },
}

/// Indexable collection of `(features, targets)` pairs.
pub trait DataSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn n_features(&self) -> usize;

    fn n_targets(&self) -> usize;

    /// Features and targets of item `index`.
    fn item(&self, index: usize) -> (Vec<f32>, Vec<f32>);

    /// Returns the in-memory arrays if the source already holds them.
    fn as_tensor_dataset(&self) -> Option<&TensorDataset> {
        None
    }

    /// Collects every item into one in-memory dataset.
    fn materialize(&self) -> Result<TensorDataset, DataError> {
        if let Some(tensors) = self.as_tensor_dataset() {
            return Ok(tensors.clone());
        }
        let indices: Vec<usize> = (0..self.len()).collect();
        TensorDataset::from_items(
            indices.iter().map(|&i| self.item(i)),
            self.n_features(),
            self.n_targets(),
        )
    }
}

/// Features and targets held as row-major arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDataset {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
}

impl TensorDataset {
    pub fn new(x: Array2<f32>, y: Array2<f32>) -> Result<Self, DataError> {
        if x.nrows() != y.nrows() {
            return Err(DataError::Shape(format!(
                "{} feature rows but {} target rows",
                x.nrows(),
                y.nrows()
            )));
        }
        Ok(Self { x, y })
    }

    /// Stacks `(features, targets)` items into arrays of the given widths.
    pub fn from_items(
        items: impl Iterator<Item = (Vec<f32>, Vec<f32>)>,
        n_features: usize,
        n_targets: usize,
    ) -> Result<Self, DataError> {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut rows = 0;
        for (x, y) in items {
            xs.extend(x);
            ys.extend(y);
            rows += 1;
        }
        let x = Array2::from_shape_vec((rows, n_features), xs)
            .map_err(|e| DataError::Shape(e.to_string()))?;
        let y = Array2::from_shape_vec((rows, n_targets), ys)
            .map_err(|e| DataError::Shape(e.to_string()))?;
        Self::new(x, y)
    }

    /// Rows `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> TensorDataset {
        TensorDataset {
            x: self.x.select(Axis(0), indices),
            y: self.y.select(Axis(0), indices),
        }
    }
}

impl DataSource for TensorDataset {
    fn len(&self) -> usize {
        self.x.nrows()
    }

    fn n_features(&self) -> usize {
        self.x.ncols()
    }

    fn n_targets(&self) -> usize {
        self.y.ncols()
    }

    fn item(&self, index: usize) -> (Vec<f32>, Vec<f32>) {
        (self.x.row(index).to_vec(), self.y.row(index).to_vec())
    }

    fn as_tensor_dataset(&self) -> Option<&TensorDataset> {
        Some(self)
    }
}

/// Train and test splits of one dataset.
#[derive(Clone)]
pub struct Dataset {
    pub name: String,
    pub train: Arc<dyn DataSource>,
    pub test: Arc<dyn DataSource>,
    pub task: Task,
}

impl Dataset {
    /// Checks that both splits are non-empty and agree on their widths.
    pub fn check(&self) -> Result<(), DataError> {
        if self.train.is_empty() {
            return Err(DataError::Empty("train"));
        }
        if self.test.is_empty() {
            return Err(DataError::Empty("test"));
        }
        if self.train.n_features() != self.test.n_features()
            || self.train.n_targets() != self.test.n_targets()
        {
            return Err(DataError::Shape(format!(
                "train is {}->{} but test is {}->{}",
                self.train.n_features(),
                self.train.n_targets(),
                self.test.n_features(),
                self.test.n_targets()
            )));
        }
        if let Task::Classification { n_classes } = self.task {
            if self.train.n_targets() != n_classes {
                return Err(DataError::Shape(format!(
                    "{n_classes} classes but targets have width {}",
                    self.train.n_targets()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("train_len", &self.train.len())
            .field("test_len", &self.test.len())
            .field("task", &self.task)
            .finish()
    }
}

/// Looks datasets up by name.
pub trait DatasetProvider {
    fn dataset(&self, name: &str) -> Result<Dataset, DataError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parse_data_ids() {
        assert_eq!(
            "toy_regression".parse::<DataId>().unwrap(),
            DataId::Named("toy_regression".to_string())
        );
        let id: DataId = "synthetic.toy_regression.laplace".parse().unwrap();
        assert_eq!(
            id,
            DataId::Synthetic {
                base: "toy_regression".to_string(),
                prior: PriorFamily::Laplace
            }
        );
        assert_eq!(id.base(), "toy_regression");
    }

    #[test]
    fn test_malformed_data_ids() {
        for bad in ["", "synthetic", "synthetic.", "synthetic.toy", "synthetic..gaussian"] {
            assert!(
                matches!(bad.parse::<DataId>(), Err(ConfigError::DataId(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(matches!(
            "synthetic.toy.cauchy".parse::<DataId>(),
            Err(ConfigError::UnknownPrior(_))
        ));
    }

    #[test]
    fn test_tensor_dataset_rows() {
        let data = TensorDataset::new(array![[1.0, 2.0], [3.0, 4.0]], array![[0.5], [1.5]]).unwrap();
        assert_eq!(data.item(1), (vec![3.0, 4.0], vec![1.5]));
        let picked = data.select(&[1, 0]);
        assert_eq!(picked.y, array![[1.5], [0.5]]);
        assert!(TensorDataset::new(array![[1.0]], array![[1.0], [2.0]]).is_err());
    }
}

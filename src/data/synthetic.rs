//! Datasets whose labels come from a network drawn from the prior.
//!
//! The features of a base dataset are kept; the targets are replaced by the outputs of a
//! throwaway model whose parameters were all sampled from their priors. The generating
//! parameters are kept as ground truth so the posterior can be compared against them.

use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use ndarray::Array2;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand_distr::Normal;
use serde::Serialize;

use super::{DataSource, Dataset, Task, TensorDataset};
use crate::artifacts::ArtifactDir;
use crate::config::ModelKind;
use crate::error::{DataError, RunError};
use crate::model::{get_model, ModelSpec, PosteriorModel};
use crate::params::{tensor_to_vec, ParamStore};
use crate::prior::PriorFamily;

pub const DATA_ARTIFACT: &str = "synthetic_data.json";
pub const MODEL_ARTIFACT: &str = "true_model.json";

/// A synthetic dataset together with the parameters that generated it.
#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub dataset: Dataset,
    pub true_params: ParamStore,
    pub prior: PriorFamily,
    train: TensorDataset,
    test: TensorDataset,
}

#[derive(Serialize)]
struct DataSnapshot<'a> {
    name: &'a str,
    prior: PriorFamily,
    task: Task,
    train: &'a TensorDataset,
    test: &'a TensorDataset,
}

impl SyntheticData {
    /// Draws a model with `prior` on its weights and relabels both splits of `base` with it.
    ///
    /// Fails with a configuration error if `prior` cannot be sampled from.
    pub fn generate<B: AutodiffBackend>(
        base: &Dataset,
        prior: PriorFamily,
        kind: ModelKind,
        spec: ModelSpec,
        device: &B::Device,
        seed: u64,
    ) -> Result<Self, RunError> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let spec = spec.with_weight_prior(prior);
        let mut model = get_model::<B>(kind, spec, device, &mut rng)?;
        model.sample_all_priors(&mut rng)?;
        model.eval();
        let true_params = model.state_dict()?;

        let mut relabel = |source: &Arc<dyn DataSource>| -> Result<TensorDataset, RunError> {
            let data = source.materialize()?;
            let y = label::<B, _>(&model, &data, spec.noise_std, &mut rng)?;
            Ok(TensorDataset::new(data.x, y)?)
        };
        let train = relabel(&base.train)?;
        let test = relabel(&base.test)?;

        let dataset = Dataset {
            name: format!("synthetic.{}.{}", base.name, prior),
            train: Arc::new(train.clone()),
            test: Arc::new(test.clone()),
            task: base.task,
        };
        dataset.check()?;
        Ok(Self {
            dataset,
            true_params,
            prior,
            train,
            test,
        })
    }

    /// Writes the relabeled dataset and the generating parameters into the run directory.
    pub fn persist(&self, artifacts: &ArtifactDir) -> Result<(), RunError> {
        artifacts.write_json(
            DATA_ARTIFACT,
            &DataSnapshot {
                name: &self.dataset.name,
                prior: self.prior,
                task: self.dataset.task,
                train: &self.train,
                test: &self.test,
            },
        )?;
        artifacts.write_json(MODEL_ARTIFACT, &self.true_params)?;
        Ok(())
    }
}

/// Regression targets get Gaussian observation noise; class labels are drawn from the
/// predicted class probabilities and one-hot encoded.
fn label<B: AutodiffBackend, M: PosteriorModel<B>>(
    model: &M,
    data: &TensorDataset,
    noise_std: f64,
    rng: &mut SmallRng,
) -> Result<Array2<f32>, RunError> {
    let batch: super::Batch = data.clone().into();
    let (x, _) = batch.to_tensors::<B>(model.device());
    let out = model.predict(&model.params(), x);
    let [rows, cols] = out.dims();
    let values = tensor_to_vec(out)?;
    let shape_err = |e: ndarray::ShapeError| DataError::Shape(e.to_string());
    match model.task() {
        Task::Regression => {
            let noise = Normal::new(0.0, noise_std as f32)
                .map_err(|e| DataError::Shape(e.to_string()))?;
            let noisy = values.iter().map(|&v| v + noise.sample(rng)).collect();
            Ok(Array2::from_shape_vec((rows, cols), noisy).map_err(shape_err)?)
        }
        Task::Classification { .. } => {
            let mut y = Array2::<f32>::zeros((rows, cols));
            for (i, probs) in values.chunks(cols).enumerate() {
                let dist =
                    WeightedIndex::new(probs).map_err(|e| DataError::Shape(e.to_string()))?;
                y[[i, dist.sample(rng)]] = 1.0;
            }
            Ok(y)
        }
    }
}

//! Held-out evaluation of a set of posterior samples.

use burn::tensor::backend::AutodiffBackend;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{Batch, DataLoader, DataSource, Task};
use crate::error::RunError;
use crate::model::PosteriorModel;
use crate::params::{tensor_to_vec, ParamStore};
use crate::stats::logsumexp;

/// Summary metrics of a run, written to `result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub n_samples: usize,
    /// Mean over test points of `log (1/S) sum_s p(y_i | x_i, theta_s)`.
    pub lp_ensemble: f64,
    /// Mean of `log p(y_i | x_i, theta_s)` over samples and test points.
    pub lp_mean: f64,
    /// Accuracy of the averaged class probabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc: Option<f64>,
    /// RMSE of the averaged predictive mean.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmse: Option<f64>,
}

/// Scores every sample on the batches of `loader`, in source order.
pub fn evaluate_model<B, M>(
    model: &M,
    loader: &DataLoader,
    samples: &[ParamStore],
) -> Result<EvalSummary, RunError>
where
    B: AutodiffBackend,
    M: PosteriorModel<B>,
{
    if samples.is_empty() {
        return Err(RunError::Evaluation("no samples to evaluate".to_string()));
    }
    let device = model.device().clone();
    let batches: Vec<Batch> = loader.ordered().collect::<Result<_, _>>()?;
    let n_test = loader.dataset_len();
    let n_targets = loader.source().n_targets();
    let targets: Vec<f32> = batches.iter().flat_map(|b| b.y.iter().copied()).collect();
    let targets = Array2::from_shape_vec((n_test, n_targets), targets)
        .map_err(|e| RunError::Evaluation(e.to_string()))?;

    let mut log_liks = Array2::<f64>::zeros((samples.len(), n_test));
    let mut mean_prediction = Array2::<f64>::zeros((n_test, n_targets));
    for (k, store) in samples.iter().enumerate() {
        let theta = model.layout().tensor_from_store::<B>(store, &device)?;
        let mut row = 0;
        for batch in &batches {
            let (x, y) = batch.to_tensors::<B>(&device);
            let ll = tensor_to_vec(model.log_likelihood(&theta, x.clone(), y))?;
            let prediction = tensor_to_vec(model.predict(&theta, x))?;
            for (i, value) in ll.into_iter().enumerate() {
                log_liks[[k, row + i]] = value as f64;
            }
            let prediction = ArrayView2::from_shape((batch.len(), n_targets), &prediction)
                .map_err(|e| RunError::Evaluation(e.to_string()))?;
            let mut slot = mean_prediction.slice_mut(s![row..row + batch.len(), ..]);
            slot += &prediction.mapv(f64::from);
            row += batch.len();
        }
    }
    mean_prediction /= samples.len() as f64;

    let log_s = (samples.len() as f64).ln();
    let lp_ensemble = log_liks
        .columns()
        .into_iter()
        .map(|column| logsumexp(&column.to_vec()) - log_s)
        .sum::<f64>()
        / n_test as f64;
    let lp_mean = log_liks.mean().unwrap_or(f64::NAN);

    let (acc, rmse) = match model.task() {
        Task::Classification { .. } => (Some(accuracy(&mean_prediction, &targets)), None),
        Task::Regression => (None, Some(rmse(&mean_prediction, &targets))),
    };
    Ok(EvalSummary {
        n_samples: samples.len(),
        lp_ensemble,
        lp_mean,
        acc,
        rmse,
    })
}

fn argmax<'a>(values: impl IntoIterator<Item = &'a f64>) -> usize {
    values
        .into_iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

fn accuracy(probs: &Array2<f64>, one_hot: &Array2<f32>) -> f64 {
    let hits = probs
        .rows()
        .into_iter()
        .zip(one_hot.rows())
        .filter(|(p, y)| argmax(p.iter()) == argmax(y.mapv(f64::from).iter()))
        .count();
    hits as f64 / probs.nrows() as f64
}

fn rmse(mean: &Array2<f64>, targets: &Array2<f32>) -> f64 {
    let diff = mean - &targets.mapv(f64::from);
    diff.mapv(|d| d * d).mean().unwrap_or(f64::NAN).sqrt()
}

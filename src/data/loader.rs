//! Mini-batch loading.
//!
//! In-memory sources are sliced directly. Other sources fetch their items on a `rayon` pool
//! when the loader was given workers, and sequentially otherwise.

use std::sync::Arc;

use burn::prelude::*;
use ndarray::Array2;
use rand::prelude::*;
use rayon::prelude::*;

use super::{DataSource, TensorDataset};
use crate::error::DataError;

/// Worker count used for sources that are not already in memory.
pub const DEFAULT_WORKERS: usize = 2;

/// Batch and worker sizes for the loaders of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderPlan {
    pub train_batch_size: usize,
    pub test_batch_size: usize,
    /// Batch size of the final evaluation, never larger than the test split.
    pub eval_batch_size: usize,
    pub num_workers: usize,
}

impl LoaderPlan {
    /// An unset `batch_size` means full-batch on the training split. Worker threads are only
    /// used when the training split is not already held in memory.
    pub fn resolve(
        batch_size: Option<usize>,
        train_len: usize,
        test_len: usize,
        in_memory: bool,
    ) -> Result<Self, DataError> {
        if train_len == 0 {
            return Err(DataError::Empty("train"));
        }
        if test_len == 0 {
            return Err(DataError::Empty("test"));
        }
        let batch_size = batch_size.unwrap_or(train_len);
        Ok(Self {
            train_batch_size: batch_size,
            test_batch_size: batch_size,
            eval_batch_size: batch_size.min(test_len),
            num_workers: if in_memory { 0 } else { DEFAULT_WORKERS },
        })
    }
}

/// Features and targets of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.x.nrows() == 0
    }

    /// Copies the batch onto `device` as `[n, features]` and `[n, targets]` tensors.
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 2>) {
        (to_tensor(&self.x, device), to_tensor(&self.y, device))
    }
}

impl From<TensorDataset> for Batch {
    fn from(data: TensorDataset) -> Self {
        Batch {
            x: data.x,
            y: data.y,
        }
    }
}

fn to_tensor<B: Backend>(array: &Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = array.dim();
    let values: Vec<f32> = array.iter().copied().collect();
    Tensor::<B, 2>::from_data(TensorData::new(values, [rows, cols]), device)
}

pub struct DataLoader {
    source: Arc<dyn DataSource>,
    batch_size: usize,
    shuffle: bool,
    pool: Option<rayon::ThreadPool>,
    rng: SmallRng,
}

impl DataLoader {
    pub fn new(
        source: Arc<dyn DataSource>,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self, DataError> {
        if batch_size == 0 {
            return Err(DataError::Shape("batch size must be positive".to_string()));
        }
        let pool = if num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("data-loader-{i}"))
                    .build()
                    .map_err(|e| DataError::Workers(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(Self {
            source,
            batch_size,
            shuffle,
            pool,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_workers(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(0, |pool| pool.current_num_threads())
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    /// Number of items in the underlying source.
    pub fn dataset_len(&self) -> usize {
        self.source.len()
    }

    /// Batches per epoch; the last batch may be short.
    pub fn len(&self) -> usize {
        self.source.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Starts a new pass over the data, reshuffling if enabled.
    pub fn epoch(&mut self) -> Epoch<'_> {
        let mut order: Vec<usize> = (0..self.source.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        Epoch {
            loader: self,
            order,
            cursor: 0,
        }
    }

    /// A pass in source order that leaves the shuffling state untouched.
    pub fn ordered(&self) -> Epoch<'_> {
        Epoch {
            loader: self,
            order: (0..self.source.len()).collect(),
            cursor: 0,
        }
    }

    /// Every item as a single batch, in source order.
    pub fn full_batch(&self) -> Result<Batch, DataError> {
        let order: Vec<usize> = (0..self.source.len()).collect();
        self.fetch(&order)
    }

    fn fetch(&self, indices: &[usize]) -> Result<Batch, DataError> {
        if let Some(tensors) = self.source.as_tensor_dataset() {
            return Ok(tensors.select(indices).into());
        }
        let source = &self.source;
        let items: Vec<(Vec<f32>, Vec<f32>)> = match &self.pool {
            Some(pool) => pool.install(|| indices.par_iter().map(|&i| source.item(i)).collect()),
            None => indices.iter().map(|&i| source.item(i)).collect(),
        };
        let data = TensorDataset::from_items(
            items.into_iter(),
            source.n_features(),
            source.n_targets(),
        )?;
        Ok(data.into())
    }
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("len", &self.source.len())
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .field("num_workers", &self.num_workers())
            .finish()
    }
}

/// One pass over a [`DataLoader`].
pub struct Epoch<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for Epoch<'_> {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let batch = self.loader.fetch(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}

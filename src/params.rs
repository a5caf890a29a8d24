//! Named parameter stores and the flat layout kernels operate on.
//!
//! Models expose their state as a [`ParamStore`] keyed by parameter name. Samplers work on a
//! single flat vector instead; a [`ParamLayout`] fixes the order and offsets of the named
//! tensors inside that vector and converts in both directions.

use std::collections::BTreeMap;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, RunnerError};

/// A dense tensor value of a single named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self { shape, values }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            values: vec![0.0; n],
        }
    }

    pub fn numel(&self) -> usize {
        self.values.len()
    }
}

/// Mapping from parameter name to tensor value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamStore {
    entries: BTreeMap<String, ParamTensor>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ParamTensor> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamTensor) -> Option<ParamTensor> {
        self.entries.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamTensor> {
        self.entries.remove(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamTensor)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlays every entry of `other` onto `self`.
    pub fn update(&mut self, other: ParamStore) {
        self.entries.extend(other.entries);
    }
}

impl FromIterator<(String, ParamTensor)> for ParamStore {
    fn from_iter<I: IntoIterator<Item = (String, ParamTensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// What a parameter is used for; priors and initializers treat the two differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamRole {
    Weight { fan_in: usize },
    Bias { fan_in: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub role: ParamRole,
    pub offset: usize,
}

impl ParamSpec {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.numel()
    }
}

/// Ordered parameter specs with their offsets in the flat vector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamLayout {
    specs: Vec<ParamSpec>,
    numel: usize,
}

impl ParamLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter and returns its spec.
    pub fn push(&mut self, name: impl Into<String>, shape: Vec<usize>, role: ParamRole) -> &ParamSpec {
        let spec = ParamSpec {
            name: name.into(),
            shape,
            role,
            offset: self.numel,
        };
        self.numel += spec.numel();
        self.specs.push(spec);
        &self.specs[self.specs.len() - 1]
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Total number of scalars.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Packs a store into the flat vector. Every layout entry must be present with its shape.
    pub fn flatten(&self, store: &ParamStore) -> Result<Vec<f32>, CheckpointError> {
        let mut flat = Vec::with_capacity(self.numel);
        for spec in &self.specs {
            let value = store
                .get(&spec.name)
                .ok_or_else(|| CheckpointError::Layout(format!("missing `{}`", spec.name)))?;
            if value.shape != spec.shape || value.values.len() != spec.numel() {
                return Err(CheckpointError::Layout(format!(
                    "`{}` has shape {:?}, expected {:?}",
                    spec.name, value.shape, spec.shape
                )));
            }
            flat.extend_from_slice(&value.values);
        }
        Ok(flat)
    }

    pub fn unflatten(&self, flat: &[f32]) -> Result<ParamStore, CheckpointError> {
        if flat.len() != self.numel {
            return Err(CheckpointError::Layout(format!(
                "flat vector has {} values, layout needs {}",
                flat.len(),
                self.numel
            )));
        }
        Ok(self
            .specs
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    ParamTensor::new(spec.shape.clone(), flat[spec.range()].to_vec()),
                )
            })
            .collect())
    }

    /// Reads a flat parameter tensor back into a named store.
    pub fn store_from_tensor<B: Backend>(
        &self,
        theta: Tensor<B, 1>,
    ) -> Result<ParamStore, RunnerError> {
        let flat = tensor_to_vec(theta)?;
        Ok(self.unflatten(&flat)?)
    }

    pub fn tensor_from_store<B: Backend>(
        &self,
        store: &ParamStore,
        device: &B::Device,
    ) -> Result<Tensor<B, 1>, CheckpointError> {
        let flat = self.flatten(store)?;
        Ok(Tensor::<B, 1>::from_data(
            TensorData::new(flat, [self.numel]),
            device,
        ))
    }
}

/// Copies a tensor's values into a `Vec<f32>`, whatever the backend's float type.
pub fn tensor_to_vec<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, RunnerError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| RunnerError::TensorData(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    fn layout() -> ParamLayout {
        let mut layout = ParamLayout::new();
        layout.push("layers.0.weight", vec![2, 3], ParamRole::Weight { fan_in: 2 });
        layout.push("layers.0.bias", vec![3], ParamRole::Bias { fan_in: 2 });
        layout
    }

    #[test]
    fn test_layout_offsets() {
        let layout = layout();
        assert_eq!(layout.numel(), 9);
        assert_eq!(layout.spec("layers.0.bias").unwrap().range(), 6..9);
    }

    #[test]
    fn test_flatten_rejects_shape_mismatch() {
        let layout = layout();
        let mut store = layout.unflatten(&[0.0; 9]).unwrap();
        store.insert("layers.0.bias", ParamTensor::zeros(vec![4]));
        assert!(matches!(
            layout.flatten(&store),
            Err(CheckpointError::Layout(_))
        ));
        store.remove("layers.0.bias");
        assert!(layout.flatten(&store).is_err());
    }

    #[test]
    fn test_tensor_conversion_preserves_order() {
        let layout = layout();
        let values: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let store = layout.unflatten(&values).unwrap();
        assert_eq!(store.get("layers.0.bias").unwrap().values, vec![6.0, 7.0, 8.0]);

        let device = NdArrayDevice::Cpu;
        let theta = layout
            .tensor_from_store::<NdArray>(&store, &device)
            .unwrap();
        let back = layout.store_from_tensor(theta).unwrap();
        assert_eq!(back, store);
    }
}

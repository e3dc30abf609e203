//! Named tensor batches handed to [`get_gradients`](crate::get_gradients).

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::errors::{GradientError, Result};

pub const INPUT_IDS: &str = "input_ids";
pub const LABELS: &str = "labels";
pub const ATTENTION_MASK: &str = "attention_mask";

/// Fields every batch must carry for a forward pass.
pub const REQUIRED_FIELDS: [&str; 3] = [INPUT_IDS, LABELS, ATTENTION_MASK];

/// Label value that marks a position as excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Mapping from field name to tensor.
///
/// Extra fields are carried along untouched; only [`REQUIRED_FIELDS`] are read
/// by the snapshot routine.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    fields: BTreeMap<String, Tensor>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a batch holding exactly the three required fields.
    pub fn from_parts(input_ids: Tensor, labels: Tensor, attention_mask: Tensor) -> Self {
        let mut batch = Self::new();
        batch.insert(INPUT_IDS, input_ids);
        batch.insert(LABELS, labels);
        batch.insert(ATTENTION_MASK, attention_mask);
        batch
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.fields.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Returns the named field or a [`GradientError::MissingBatchField`].
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.fields
            .get(name)
            .ok_or_else(|| GradientError::MissingBatchField(name.to_string()))
    }

    pub fn input_ids(&self) -> Result<&Tensor> {
        self.require(INPUT_IDS)
    }

    pub fn labels(&self) -> Result<&Tensor> {
        self.require(LABELS)
    }

    pub fn attention_mask(&self) -> Result<&Tensor> {
        self.require(ATTENTION_MASK)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of rows in `input_ids`, if present.
    pub fn batch_size(&self) -> Option<usize> {
        self.get(INPUT_IDS)
            .and_then(|ids| ids.dims().first().copied())
    }

    /// Copies every field onto `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for (name, tensor) in &self.fields {
            let moved = tensor
                .to_device(device)
                .map_err(|err| GradientError::device(format!("{:?}", device), err))?;
            fields.insert(name.clone(), moved);
        }
        Ok(Self { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[i64]) -> Tensor {
        Tensor::from_slice(values, (1, values.len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn require_names_missing_field() {
        let mut batch = Batch::new();
        batch.insert(INPUT_IDS, ids(&[1, 2, 3]));
        batch.insert(ATTENTION_MASK, ids(&[1, 1, 1]));

        match batch.labels() {
            Err(GradientError::MissingBatchField(field)) => assert_eq!(field, LABELS),
            other => panic!("expected missing labels, got {:?}", other),
        }
        assert!(batch.input_ids().is_ok());
    }

    #[test]
    fn batch_size_reads_first_dimension() {
        let batch = Batch::from_parts(ids(&[1, 2]), ids(&[1, 2]), ids(&[1, 1]));
        assert_eq!(batch.batch_size(), Some(1));
        assert_eq!(batch.len(), 3);
        let names: Vec<&str> = batch.field_names().collect();
        assert_eq!(names, vec![ATTENTION_MASK, INPUT_IDS, LABELS]);
    }
}

use std::collections::HashMap;

use candle_core::Tensor;

/// Insertion-ordered mapping from parameter name to gradient tensor.
///
/// Order matters: [`get_flattened_weight_vector`](crate::get_flattened_weight_vector)
/// concatenates values in exactly this order.
#[derive(Debug, Clone, Default)]
pub struct GradientMap {
    entries: Vec<(String, Tensor)>,
    index: HashMap<String, usize>,
}

impl GradientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Inserts `tensor` under `name`. Replacing an existing key keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        let name = name.into();
        if let Some(&position) = self.index.get(&name) {
            let previous = std::mem::replace(&mut self.entries[position].1, tensor);
            return Some(previous);
        }
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push((name, tensor));
        None
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index.get(name).map(|&position| &self.entries[position].1)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Tensor> {
        self.entries.iter().map(|(_, tensor)| tensor)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// True when both maps hold the same key set, regardless of order.
    pub fn same_keys(&self, other: &GradientMap) -> bool {
        self.len() == other.len() && self.keys().all(|key| other.contains_key(key))
    }

    /// Total number of scalar elements across all tensors.
    pub fn element_count(&self) -> usize {
        self.values().map(Tensor::elem_count).sum()
    }
}

impl FromIterator<(String, Tensor)> for GradientMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut map = GradientMap::new();
        for (name, tensor) in iter {
            map.insert(name, tensor);
        }
        map
    }
}

impl IntoIterator for GradientMap {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

//! Element-wise comparison of gradient snapshots.

use candle_core::{DType, Tensor};

use crate::{errors::Result, flatten::get_flattened_weight_vector, map::GradientMap};

/// Exact equality: same shape, same dtype and every element identical.
///
/// NaN never compares equal, so a snapshot containing NaN is never equal to
/// itself.
pub fn tensors_equal(left: &Tensor, right: &Tensor) -> Result<bool> {
    if left.dims() != right.dims() || left.dtype() != right.dtype() {
        return Ok(false);
    }
    if left.elem_count() == 0 {
        return Ok(true);
    }
    let right = right.to_device(left.device())?;
    let mismatches = left
        .ne(&right)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(mismatches == 0)
}

/// Key-by-key outcome of comparing two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradientComparison {
    pub equal: Vec<String>,
    pub different: Vec<String>,
    pub only_left: Vec<String>,
    pub only_right: Vec<String>,
}

impl GradientComparison {
    pub fn keys_match(&self) -> bool {
        self.only_left.is_empty() && self.only_right.is_empty()
    }

    /// Same key set and every shared tensor identical.
    pub fn all_equal(&self) -> bool {
        self.keys_match() && self.different.is_empty()
    }

    /// Same key set and every shared tensor differs somewhere.
    pub fn all_different(&self) -> bool {
        self.keys_match() && self.equal.is_empty()
    }

    pub fn shared_keys(&self) -> usize {
        self.equal.len() + self.different.len()
    }
}

/// Compares two snapshots in `left`'s key order.
pub fn compare_gradients(left: &GradientMap, right: &GradientMap) -> Result<GradientComparison> {
    let mut comparison = GradientComparison::default();
    for (name, tensor) in left.iter() {
        match right.get(name) {
            Some(other) if tensors_equal(tensor, other)? => {
                comparison.equal.push(name.to_string())
            }
            Some(_) => comparison.different.push(name.to_string()),
            None => comparison.only_left.push(name.to_string()),
        }
    }
    comparison.only_right = right
        .keys()
        .filter(|name| !left.contains_key(name))
        .map(str::to_string)
        .collect();
    Ok(comparison)
}

/// Euclidean norm of a tensor, computed in `f64`.
pub fn l2_norm(tensor: &Tensor) -> Result<f64> {
    let sum = tensor
        .to_dtype(DType::F64)?
        .sqr()?
        .sum_all()?
        .to_scalar::<f64>()?;
    Ok(sum.sqrt())
}

/// Cosine similarity between the flattened forms of two snapshots.
///
/// Returns `None` when the flattened lengths differ or either vector is zero.
pub fn cosine_similarity(left: &GradientMap, right: &GradientMap) -> Result<Option<f64>> {
    let left = get_flattened_weight_vector(left)?.to_dtype(DType::F64)?;
    let right = get_flattened_weight_vector(right)?.to_dtype(DType::F64)?;
    if left.dims() != right.dims() {
        return Ok(None);
    }
    let left_norm = l2_norm(&left)?;
    let right_norm = l2_norm(&right)?;
    if left_norm == 0.0 || right_norm == 0.0 {
        return Ok(None);
    }
    let dot = (&left * &right)?.sum_all()?.to_scalar::<f64>()?;
    Ok(Some(dot / (left_norm * right_norm)))
}

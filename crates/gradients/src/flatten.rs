use candle_core::{DType, Device, Tensor};

use crate::{
    errors::{GradientError, Result},
    map::GradientMap,
};

/// Concatenates every tensor of `weights` into one host-resident 1-D tensor.
///
/// Values are visited in the map's iteration order. An empty map yields an
/// empty `f32` vector. Tensors of differing dtypes cannot be concatenated and
/// produce [`GradientError::Shape`].
pub fn get_flattened_weight_vector(weights: &GradientMap) -> Result<Tensor> {
    let mut flattened = Vec::with_capacity(weights.len());
    let mut dtype: Option<(DType, &str)> = None;

    for (name, tensor) in weights.iter() {
        match dtype {
            None => dtype = Some((tensor.dtype(), name)),
            Some((expected, first)) if expected != tensor.dtype() => {
                return Err(GradientError::Shape(format!(
                    "cannot concatenate `{name}` ({:?}) with `{first}` ({:?})",
                    tensor.dtype(),
                    expected
                )));
            }
            Some(_) => {}
        }
        flattened.push(tensor.to_device(&Device::Cpu)?.flatten_all()?);
    }

    if flattened.is_empty() {
        return Ok(Tensor::zeros(0, DType::F32, &Device::Cpu)?);
    }

    Ok(Tensor::cat(&flattened, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_in_insertion_order() -> anyhow::Result<()> {
        let mut map = GradientMap::new();
        map.insert("a", Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu)?);
        map.insert("b", Tensor::new(&[5f32, 6.], &Device::Cpu)?);

        let flat = get_flattened_weight_vector(&map)?;

        assert_eq!(flat.dims(), &[6]);
        assert_eq!(flat.to_vec1::<f32>()?, vec![1., 2., 3., 4., 5., 6.]);
        Ok(())
    }

    #[test]
    fn order_follows_map_not_names() -> anyhow::Result<()> {
        let mut map = GradientMap::new();
        map.insert("z", Tensor::new(&[9f32], &Device::Cpu)?);
        map.insert("a", Tensor::new(&[1f32], &Device::Cpu)?);

        let flat = get_flattened_weight_vector(&map)?;
        assert_eq!(flat.to_vec1::<f32>()?, vec![9., 1.]);
        Ok(())
    }

    #[test]
    fn empty_map_gives_empty_vector() -> anyhow::Result<()> {
        let flat = get_flattened_weight_vector(&GradientMap::new())?;
        assert_eq!(flat.dims(), &[0]);
        assert_eq!(flat.elem_count(), 0);
        Ok(())
    }

    #[test]
    fn mixed_dtypes_are_rejected() -> anyhow::Result<()> {
        let mut map = GradientMap::new();
        map.insert("f", Tensor::new(&[1f32], &Device::Cpu)?);
        map.insert("i", Tensor::new(&[1i64], &Device::Cpu)?);

        match get_flattened_weight_vector(&map) {
            Err(GradientError::Shape(message)) => assert!(message.contains("`i`")),
            other => panic!("expected shape error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn input_is_left_untouched() -> anyhow::Result<()> {
        let mut map = GradientMap::new();
        map.insert("w", Tensor::new(&[[1f32, 2.]], &Device::Cpu)?);

        let _ = get_flattened_weight_vector(&map)?;

        assert_eq!(map.get("w").map(|t| t.dims().to_vec()), Some(vec![1, 2]));
        Ok(())
    }
}

//! Layer normalisation built from differentiable tensor ops.
//!
//! `candle_nn::LayerNorm` dispatches to a fused kernel without a backward
//! pass, so gradients would stop at the first norm. This version computes
//! mean and variance over the last axis explicitly.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = xs.dim(D::Minus1)? as f64;
        let mean = (xs.sum_keepdim(D::Minus1)? / hidden)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden)?;
        let normalized = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normalized.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Registers `weight` (ones) and `bias` (zeros) of size `size` under `vb`.
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, eps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn normalizes_last_axis() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = layer_norm(4, 1e-5, vb)?;

        let xs = Tensor::new(&[[[1f32, 2., 3., 4.], [2., 2., 2., 2.]]], &Device::Cpu)?;
        let out = norm.forward(&xs)?.to_vec3::<f32>()?;

        let row = &out[0][0];
        let mean: f32 = row.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((row[3] - 1.3416).abs() < 1e-3);
        assert!(out[0][1].iter().all(|v| v.abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn gradients_reach_input_and_affine_parameters() -> Result<()> {
        let device = Device::Cpu;
        let weight = Var::new(&[1f32, 1., 1.], &device)?;
        let bias = Var::new(&[0f32, 0., 0.], &device)?;
        let input = Var::new(&[[[0.5f32, -1.0, 2.0]]], &device)?;
        let norm = LayerNorm::new(weight.as_tensor().clone(), bias.as_tensor().clone(), 1e-5);

        let scale = Tensor::new(&[1f32, 2., 3.], &device)?;
        let loss = norm.forward(input.as_tensor())?.broadcast_mul(&scale)?.sum_all()?;
        let grads = loss.backward()?;

        for tensor in [weight.as_tensor(), bias.as_tensor(), input.as_tensor()] {
            let grad = grads.get(tensor).expect("gradient recorded");
            let magnitude = grad.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert!(magnitude > 0.0);
        }
        Ok(())
    }
}

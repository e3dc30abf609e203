pub use dataset;
pub use gradients;
pub use gradients::{
    compare_gradients, cosine_similarity, device_label, get_flattened_weight_vector,
    get_gradients, l2_norm, parse_device, tensors_equal, Batch, ForwardInput, GradientComparison,
    GradientError, GradientMap, GradientModel, ModelOutput,
};
pub use model;
pub use probe;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Picks the best available backend, falling back to CPU when an
/// accelerator is missing or fails a small preflight.
///
/// `CANDLE_FORCE_CPU` in the environment always selects the CPU.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }

    let device = parse_device("auto")?;
    if device.is_cpu() {
        log::info!("no accelerator available, using CPU backend");
        return Ok(device);
    }

    match preflight(&device) {
        Ok(()) => {
            log::info!("{} device selected", device_label(&device));
            Ok(device)
        }
        Err(err) => {
            log::warn!(
                "{} device failed preflight ({err}), falling back to CPU",
                device_label(&device)
            );
            Ok(Device::Cpu)
        }
    }
}

/// Exercises the ops a gradient snapshot relies on: matmul, embedding
/// lookup and a backward pass.
fn preflight(device: &Device) -> Result<()> {
    let a = Tensor::ones((2, 4), DType::F32, device)?;
    let b = Tensor::ones((4, 2), DType::F32, device)?;
    let _ = a.matmul(&b)?;

    let indices = Tensor::from_vec((0..8u32).collect::<Vec<_>>(), (8,), device)?;
    let table = candle_core::Var::randn(0f32, 1f32, (8, 16), device)?;
    let loss = table.as_tensor().index_select(&indices, 0)?.sqr()?.sum_all()?;
    let grads = loss.backward()?;
    if grads.get(table.as_tensor()).is_none() {
        anyhow::bail!("backward produced no gradient");
    }
    Ok(())
}

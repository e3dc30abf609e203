use candle_core::{Device, Tensor};

use crate::{
    batch::{Batch, ATTENTION_MASK, INPUT_IDS, LABELS},
    device::{device_label, TargetDevice},
    errors::{GradientError, Result},
    map::GradientMap,
    model::{ForwardInput, GradientModel},
};

/// Computes the per-parameter gradients of `model` on `batch`.
///
/// The model's accumulators are cleared first, so repeated calls never sum
/// gradients across invocations. The forward pass runs on `device` with
/// caching disabled and exactly one backward pass follows. Every gradient is
/// copied, detached and moved to host memory before it is returned; the
/// result never aliases the model's own buffers.
///
/// Parameters without a gradient are left out, so the key set is exactly the
/// set of parameters that received one during this call.
///
/// The model is left holding the gradients of this call.
pub fn get_gradients<M, D>(model: &mut M, batch: &Batch, device: D) -> Result<GradientMap>
where
    M: GradientModel + ?Sized,
    D: TargetDevice,
{
    let input_ids = batch.require(INPUT_IDS)?;
    let labels = batch.require(LABELS)?;
    let attention_mask = batch.require(ATTENTION_MASK)?;
    let device = device.resolve()?;

    model.zero_grad();

    let input_ids = relocate(input_ids, &device)?;
    let labels = relocate(labels, &device)?;
    let attention_mask = relocate(attention_mask, &device)?;

    let input = ForwardInput::new(&input_ids)
        .with_labels(&labels)
        .with_attention_mask(&attention_mask)
        .with_cache(false);
    let output = model.forward(&input).map_err(|err| {
        GradientError::invalid_model(format!("forward pass rejected the inputs: {err}"))
    })?;

    let loss = output.loss.ok_or_else(|| {
        GradientError::invalid_model("forward pass returned no loss for labelled inputs")
    })?;
    let loss = ensure_scalar(loss)?;

    model.backward(&loss).map_err(GradientError::Backward)?;

    let mut gradients = GradientMap::new();
    let mut skipped = 0usize;
    for (name, grad) in model.named_gradients() {
        match grad {
            Some(grad) => {
                let snapshot = grad.copy()?.detach().to_device(&Device::Cpu)?;
                gradients.insert(name, snapshot);
            }
            None => skipped += 1,
        }
    }

    if gradients.is_empty() {
        return Err(GradientError::invalid_model(
            "loss is not attached to any model parameter",
        ));
    }

    log::debug!(
        "gradient snapshot on {}: {} parameter(s), {} without gradient, {} element(s)",
        device_label(&device),
        gradients.len(),
        skipped,
        gradients.element_count()
    );

    Ok(gradients)
}

fn relocate(tensor: &Tensor, device: &Device) -> Result<Tensor> {
    tensor
        .to_device(device)
        .map_err(|err| GradientError::device(device_label(device), err))
}

fn ensure_scalar(loss: Tensor) -> Result<Tensor> {
    match loss.rank() {
        0 => Ok(loss),
        _ if loss.elem_count() == 1 => Ok(loss.flatten_all()?.squeeze(0)?),
        _ => Err(GradientError::invalid_model(format!(
            "loss must be a scalar, got shape {:?}",
            loss.dims()
        ))),
    }
}

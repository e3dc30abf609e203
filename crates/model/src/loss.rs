use candle_core::{DType, Error, Result, Tensor, D};
pub use gradients::IGNORE_INDEX;

/// Mean next-token cross entropy.
///
/// `logits` is `(batch, seq, vocab)` and `labels` is `(batch, seq)`. Position
/// `t` of the logits is scored against label `t + 1`; labels equal to
/// [`IGNORE_INDEX`] (or any negative value) contribute nothing.
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let (label_batch, label_len) = labels.dims2()?;
    if label_batch != batch || label_len != seq_len {
        return Err(Error::Msg(format!(
            "labels shape ({label_batch}, {label_len}) does not match logits ({batch}, {seq_len})"
        )));
    }
    if seq_len < 2 {
        return Err(Error::Msg(
            "causal language modelling loss needs sequences of at least two tokens".into(),
        ));
    }

    let steps = seq_len - 1;
    let logits = logits
        .narrow(1, 0, steps)?
        .contiguous()?
        .reshape((batch * steps, vocab))?;
    let targets = labels
        .narrow(1, 1, steps)?
        .to_dtype(DType::I64)?
        .contiguous()?
        .reshape(batch * steps)?;

    let valid = targets.ge(0i64)?.to_dtype(logits.dtype())?;
    let valid_count = valid.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if valid_count == 0.0 {
        return Err(Error::Msg("every label is ignored; nothing to score".into()));
    }

    let safe_targets = targets.maximum(0i64)?.to_dtype(DType::U32)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_targets.unsqueeze(1)?, 1)?
        .squeeze(1)?;

    let total = (picked * valid)?.sum_all()?;
    total.affine(-1.0 / valid_count as f64, 0.0)
}

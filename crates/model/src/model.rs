use std::collections::{BTreeSet, HashSet};

use candle_core::{backprop::GradStore, DType, Device, Error, Result, Tensor, Var};
use candle_nn::{Dropout, Embedding, Linear, Module, VarBuilder, VarMap};
use gradients::{ForwardInput, GradientModel, ModelOutput};
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};

use crate::{
    block::DecoderBlock,
    config::ModelConfig,
    loss::causal_lm_loss,
    norm::{layer_norm, LayerNorm},
};

const MASKED: f32 = -1e9;
const EMBEDDING_STD: f64 = 0.02;

/// Decoder-only transformer language model with named parameters and its own
/// gradient accumulator.
pub struct CausalLm {
    config: ModelConfig,
    device: Device,
    varmap: VarMap,
    parameters: Vec<(String, Var)>,
    frozen: HashSet<String>,
    grads: Option<GradStore>,
    training: bool,
    wte: Embedding,
    wpe: Embedding,
    drop: Dropout,
    blocks: Vec<DecoderBlock>,
    ln_f: LayerNorm,
    lm_head: Linear,
}

impl CausalLm {
    /// Builds the model on `device`. Parameters are registered in
    /// construction order and initialised from `config.seed`.
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut registry = Registry::default();

        let wte = candle_nn::embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        registry.record(&varmap)?;
        let wpe = candle_nn::embedding(config.block_size, config.n_embd, vb.pp("wpe"))?;
        registry.record(&varmap)?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for layer in 0..config.n_layer {
            blocks.push(DecoderBlock::new(&config, vb.pp(format!("h.{layer}")))?);
            registry.record(&varmap)?;
        }

        let ln_f = layer_norm(config.n_embd, 1e-5, vb.pp("ln_f"))?;
        registry.record(&varmap)?;
        let lm_head = candle_nn::linear(config.n_embd, config.vocab_size, vb.pp("lm_head"))?;
        registry.record(&varmap)?;

        let parameters = registry.into_parameters();
        reinitialize(&parameters, config.seed, device)?;

        log::debug!(
            "built causal lm with {} tensors on {:?}",
            parameters.len(),
            device
        );

        Ok(Self {
            drop: Dropout::new(config.dropout),
            config,
            device: device.clone(),
            varmap,
            parameters,
            frozen: HashSet::new(),
            grads: None,
            training: false,
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Named parameters in construction order.
    pub fn parameters(&self) -> &[(String, Var)] {
        &self.parameters
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Total number of scalar weights.
    pub fn parameter_count(&self) -> usize {
        self.parameters
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Marks every parameter whose name starts with `prefix` as frozen and
    /// returns how many matched. Frozen parameters never receive gradients.
    pub fn freeze(&mut self, prefix: &str) -> usize {
        let matched: Vec<String> = self
            .parameters
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect();
        let count = matched.len();
        self.frozen.extend(matched);
        count
    }

    pub fn unfreeze(&mut self, prefix: &str) -> usize {
        let before = self.frozen.len();
        self.frozen.retain(|name| !name.starts_with(prefix));
        before - self.frozen.len()
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen.contains(name)
    }

    /// Produces logits shaped `(batch, seq, vocab_size)` and, when `labels`
    /// are supplied, the shifted next-token loss.
    pub fn forward_with(&self, input: &ForwardInput<'_>) -> Result<ModelOutput> {
        let (batch, seq_len) = input.input_ids.dims2()?;
        if seq_len == 0 {
            return Err(Error::Msg("input_ids must contain at least one token".into()));
        }
        if seq_len > self.config.block_size {
            return Err(Error::Msg(format!(
                "sequence length {seq_len} exceeds block_size {}",
                self.config.block_size
            )));
        }

        let device = input.input_ids.device();
        let token_ids = input.input_ids.to_dtype(DType::U32)?;
        let positions = Tensor::arange(0u32, seq_len as u32, device)?;

        let tok_emb = self.wte.forward(&token_ids)?;
        let pos_emb = self.wpe.forward(&positions)?;
        let mut hidden = tok_emb.broadcast_add(&pos_emb)?;
        hidden = self.drop.forward(&hidden, self.training)?;

        let mask = attention_bias(batch, seq_len, input.attention_mask, device)?;

        let mut cache = input.use_cache.then(|| Vec::with_capacity(self.blocks.len()));
        for block in &self.blocks {
            let (next, kv) = block.forward(&hidden, &mask, self.training)?;
            hidden = next;
            if let Some(cache) = cache.as_mut() {
                cache.push(kv);
            }
        }

        let hidden = self.ln_f.forward(&hidden)?;
        let logits = self.lm_head.forward(&hidden)?;

        let loss = match input.labels {
            Some(labels) => Some(causal_lm_loss(&logits, labels)?),
            None => None,
        };

        Ok(ModelOutput {
            logits,
            loss,
            cache,
        })
    }

    /// Gradient currently accumulated for `name`, if any.
    pub fn gradient(&self, name: &str) -> Option<Tensor> {
        let (_, var) = self.parameters.iter().find(|(candidate, _)| candidate == name)?;
        if self.frozen.contains(name) {
            return None;
        }
        self.grads.as_ref()?.get(var.as_tensor()).cloned()
    }

    fn merge_gradient_store(&mut self, mut new_grads: GradStore) -> Result<()> {
        let Some(accum) = self.grads.as_mut() else {
            for (name, var) in &self.parameters {
                if self.frozen.contains(name) {
                    new_grads.remove(var.as_tensor());
                }
            }
            self.grads = Some(new_grads);
            return Ok(());
        };

        for (name, var) in &self.parameters {
            if self.frozen.contains(name) {
                continue;
            }
            let tensor = var.as_tensor();
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }
}

impl GradientModel for CausalLm {
    fn named_gradients(&self) -> Vec<(String, Option<Tensor>)> {
        self.parameters
            .iter()
            .map(|(name, var)| {
                let grad = if self.frozen.contains(name) {
                    None
                } else {
                    self.grads
                        .as_ref()
                        .and_then(|grads| grads.get(var.as_tensor()).cloned())
                };
                (name.clone(), grad)
            })
            .collect()
    }

    fn zero_grad(&mut self) {
        self.grads = None;
    }

    fn forward(&self, input: &ForwardInput<'_>) -> Result<ModelOutput> {
        self.forward_with(input)
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.merge_gradient_store(grads)
    }
}

/// Additive attention bias of shape `(batch, seq, seq)`: future positions and
/// padded keys are pushed to a large negative value.
fn attention_bias(
    batch: usize,
    seq_len: usize,
    attention_mask: Option<&Tensor>,
    device: &Device,
) -> Result<Tensor> {
    let causal: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { MASKED } else { 0.0 }))
        .collect();
    let causal = Tensor::from_vec(causal, (1, seq_len, seq_len), device)?;

    let Some(mask) = attention_mask else {
        return causal.broadcast_as((batch, seq_len, seq_len))?.contiguous();
    };
    let (mask_batch, mask_len) = mask.dims2()?;
    if mask_batch != batch || mask_len != seq_len {
        return Err(Error::Msg(format!(
            "attention_mask shape ({mask_batch}, {mask_len}) does not match input_ids ({batch}, {seq_len})"
        )));
    }

    let padding = mask
        .to_dtype(DType::F32)?
        .affine(-(MASKED as f64), MASKED as f64)?
        .unsqueeze(1)?;
    causal.broadcast_add(&padding)
}

/// Records parameter names as components are built so the model can expose
/// them in construction order. Names created by one component are sorted.
#[derive(Default)]
struct Registry {
    seen: BTreeSet<String>,
    ordered: Vec<(String, Var)>,
}

impl Registry {
    fn record(&mut self, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| Error::Msg("parameter map lock poisoned".into()))?;
        let mut fresh: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| !self.seen.contains(*name))
            .collect();
        fresh.sort_by(|a, b| a.0.cmp(b.0));
        for (name, var) in fresh {
            self.seen.insert(name.clone());
            self.ordered.push((name.clone(), var.clone()));
        }
        Ok(())
    }

    fn into_parameters(self) -> Vec<(String, Var)> {
        self.ordered
    }
}

/// Overwrites every parameter from a seeded generator so identical configs
/// give identical weights regardless of the backend's own RNG.
fn reinitialize(parameters: &[(String, Var)], seed: u64, device: &Device) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let embedding_bound = EMBEDDING_STD * 3f64.sqrt();

    for (name, var) in parameters {
        let shape = var.as_tensor().shape().clone();
        let count = shape.elem_count();
        let values: Vec<f32> = match shape.dims() {
            [_, fan_in] => {
                let bound = if name.starts_with("wte") || name.starts_with("wpe") {
                    embedding_bound
                } else {
                    1.0 / (*fan_in as f64).sqrt()
                };
                let dist = Uniform::new_inclusive(-bound, bound);
                (0..count).map(|_| rng.sample(dist) as f32).collect()
            }
            _ if name.ends_with(".weight") => vec![1.0; count],
            _ => vec![0.0; count],
        };
        var.set(&Tensor::from_vec(values, shape, device)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_masks_keys_not_queries() -> Result<()> {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[1u32, 1, 0]], &device)?;
        let bias = attention_bias(1, 3, Some(&mask), &device)?.squeeze(0)?;
        let rows = bias.to_vec2::<f32>()?;

        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1] < -1e8);
        assert_eq!(rows[2][1], 0.0);
        assert!(rows[2][2] < -1e8);
        Ok(())
    }
}

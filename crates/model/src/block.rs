use candle_core::{Result, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::config::ModelConfig;
use crate::norm::{layer_norm, LayerNorm};

/// Single head of causal self-attention.
#[derive(Debug)]
pub struct Head {
    key: Linear,
    query: Linear,
    value: Linear,
    dropout: Dropout,
    scale: f64,
}

impl Head {
    pub fn new(n_embd: usize, head_size: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let key = candle_nn::linear_no_bias(n_embd, head_size, vb.pp("key"))?;
        let query = candle_nn::linear_no_bias(n_embd, head_size, vb.pp("query"))?;
        let value = candle_nn::linear_no_bias(n_embd, head_size, vb.pp("value"))?;

        Ok(Self {
            key,
            query,
            value,
            dropout: Dropout::new(dropout),
            scale: 1.0 / (head_size as f64).sqrt(),
        })
    }

    /// `mask` is additive and broadcastable to `(batch, seq, seq)`.
    ///
    /// Returns the attended values together with this head's keys and values.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let queries = self.query.forward(x)?;
        let keys = self.key.forward(x)?;
        let values = self.value.forward(x)?;

        let scores = queries
            .matmul(&keys.transpose(1, 2)?.contiguous()?)?
            .affine(self.scale, 0.0)?;
        let scores = scores.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let weights = self.dropout.forward(&weights, train)?;

        let output = weights.matmul(&values)?;
        Ok((output, keys, values))
    }
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    heads: Vec<Head>,
    proj: Linear,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let head_size = config.head_dim();
        let heads = (0..config.n_head)
            .map(|idx| {
                Head::new(
                    config.n_embd,
                    head_size,
                    config.dropout,
                    vb.pp(format!("head_{}", idx)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let proj = candle_nn::linear(config.n_embd, config.n_embd, vb.pp("proj"))?;

        Ok(Self {
            heads,
            proj,
            dropout: Dropout::new(config.dropout),
        })
    }

    /// Returns the projected output and the `(keys, values)` of all heads
    /// concatenated along the feature dimension.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let mut outputs = Vec::with_capacity(self.heads.len());
        let mut keys = Vec::with_capacity(self.heads.len());
        let mut values = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            let (output, k, v) = head.forward(x, mask, train)?;
            outputs.push(output);
            keys.push(k);
            values.push(v);
        }

        let concatenated = Tensor::cat(&outputs, 2)?;
        let projected = self.proj.forward(&concatenated)?;
        let projected = self.dropout.forward(&projected, train)?;
        Ok((projected, (Tensor::cat(&keys, 2)?, Tensor::cat(&values, 2)?)))
    }
}

/// Two-layer GELU MLP with a 4x expansion.
#[derive(Debug)]
pub struct FeedForward {
    c_fc: Linear,
    c_proj: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(n_embd: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let inner_dim = 4 * n_embd;
        Ok(Self {
            c_fc: candle_nn::linear(n_embd, inner_dim, vb.pp("c_fc"))?,
            c_proj: candle_nn::linear(inner_dim, n_embd, vb.pp("c_proj"))?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.c_fc.forward(x)?.gelu()?;
        let x = self.c_proj.forward(&x)?;
        self.dropout.forward(&x, train)
    }
}

/// Pre-norm decoder block:
/// `x = x + attn(ln1(x))`, then `x = x + mlp(ln2(x))`.
#[derive(Debug)]
pub struct DecoderBlock {
    attn: MultiHeadAttention,
    mlp: FeedForward,
    ln1: LayerNorm,
    ln2: LayerNorm,
}

impl DecoderBlock {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(config, vb.pp("attn"))?,
            mlp: FeedForward::new(config.n_embd, config.dropout, vb.pp("mlp"))?,
            ln1: layer_norm(config.n_embd, 1e-5, vb.pp("ln1"))?,
            ln2: layer_norm(config.n_embd, 1e-5, vb.pp("ln2"))?,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let (attn_out, cache) = self.attn.forward(&self.ln1.forward(x)?, mask, train)?;
        let x = x.add(&attn_out)?;
        let ffwd_out = self.mlp.forward(&self.ln2.forward(&x)?, train)?;
        Ok((x.add(&ffwd_out)?, cache))
    }
}

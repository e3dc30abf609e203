use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// High-level configuration for the decoder-only language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    /// Maximum sequence length (size of the position table).
    pub block_size: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub dropout: f32,
    /// Seed for the parameter initialisation.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            block_size: 64,
            n_embd: 32,
            n_head: 4,
            n_layer: 2,
            dropout: 0.0,
            seed: 42,
        }
    }
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head.max(1)
    }

    /// Validate structural invariants before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Msg("block_size must be greater than zero".into()));
        }
        if self.n_embd == 0 {
            return Err(Error::Msg("n_embd must be greater than zero".into()));
        }
        if self.n_layer == 0 {
            return Err(Error::Msg("n_layer must be greater than zero".into()));
        }
        if self.n_head == 0 {
            return Err(Error::Msg("n_head must be greater than zero".into()));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(Error::Msg(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg("dropout must be in [0, 1)".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 8);
    }

    #[test]
    fn rejects_indivisible_heads_and_bad_dropout() {
        let mut config = ModelConfig {
            n_embd: 30,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());

        config.n_embd = 32;
        config.dropout = 1.0;
        assert!(config.validate().is_err());
    }
}

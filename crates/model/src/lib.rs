//! Small GPT-style causal language model exposing named parameters and a
//! resettable gradient accumulator.

pub mod block;
pub mod config;
pub mod loss;
pub mod model;
pub mod norm;

pub use block::{DecoderBlock, FeedForward, Head, MultiHeadAttention};
pub use config::ModelConfig;
pub use loss::{causal_lm_loss, IGNORE_INDEX};
pub use model::CausalLm;
pub use norm::LayerNorm;

//! Text corpora, tokenizers and batch preparation for gradient probes.

pub mod batching;
pub mod corpora;
pub mod errors;
pub mod tokenizer;

pub use batching::{prepare_dataset, BatchConfig, MIN_TOKENS};
pub use corpora::{InMemoryCorpus, ShardFormat, StreamingCorpus, TextCorpus};
pub use errors::{DatasetError, Result};
pub use tokenizer::{
    load_tokenizer, save_tokenizer, token_id, train_tokenizer, TokenizerTrainingConfig,
    BOS_TOKEN, EOS_TOKEN, PAD_TOKEN,
};

use candle_core::{Device, Tensor};
use gradients::{Batch, IGNORE_INDEX};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::corpora::TextCorpus;
use crate::errors::{DatasetError, Result};
use crate::tokenizer::{token_id, PAD_TOKEN};

/// Next-token prediction needs at least one input and one target.
pub const MIN_TOKENS: usize = 2;

/// How documents are turned into padded batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Documents are truncated to this many tokens.
    pub max_length: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub add_special_tokens: bool,
    pub pad_token: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_length: 64,
            shuffle: false,
            seed: 42,
            add_special_tokens: true,
            pad_token: PAD_TOKEN.to_string(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DatasetError::config("batch_size must be greater than zero"));
        }
        if self.max_length < MIN_TOKENS {
            return Err(DatasetError::config(format!(
                "max_length must be at least {MIN_TOKENS}"
            )));
        }
        Ok(())
    }
}

/// Tokenizes every document of `corpus` and groups them into batches.
///
/// Each batch carries `input_ids` (`i64`), `attention_mask` (`u32`, 1 for
/// real tokens) and `labels` (the ids with padded positions set to
/// [`IGNORE_INDEX`]), padded to the longest document of the batch. Documents
/// that encode to fewer than [`MIN_TOKENS`] tokens are skipped and a trailing
/// partial batch is kept.
pub fn prepare_dataset<C: TextCorpus>(
    corpus: &C,
    tokenizer: &Tokenizer,
    cfg: &BatchConfig,
    device: &Device,
) -> Result<Vec<Batch>> {
    cfg.validate()?;
    let pad_id = pad_token_id(tokenizer, &cfg.pad_token)?;

    let mut documents = Vec::new();
    for line in corpus.stream()? {
        documents.push(line?);
    }
    if cfg.shuffle {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        documents.shuffle(&mut rng);
    }

    let mut sequences = Vec::with_capacity(documents.len());
    let mut skipped = 0usize;
    let mut truncated = 0usize;
    for text in documents {
        let encoding = tokenizer.encode(text, cfg.add_special_tokens)?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() < MIN_TOKENS {
            skipped += 1;
            continue;
        }
        if ids.len() > cfg.max_length {
            ids.truncate(cfg.max_length);
            truncated += 1;
        }
        sequences.push(ids);
    }

    if sequences.is_empty() {
        return Err(DatasetError::config("corpus produced no documents with at least two tokens"));
    }

    let batches = sequences
        .chunks(cfg.batch_size)
        .map(|chunk| build_batch(chunk, pad_id, device))
        .collect::<Result<Vec<_>>>()?;

    log::info!(
        "prepared {} batch(es) from {} document(s) ({} too short, {} truncated)",
        batches.len(),
        sequences.len(),
        skipped,
        truncated
    );
    Ok(batches)
}

fn pad_token_id(tokenizer: &Tokenizer, pad_token: &str) -> Result<u32> {
    match tokenizer.get_padding() {
        Some(params) if params.pad_token == pad_token => Ok(params.pad_id),
        _ => token_id(tokenizer, pad_token),
    }
}

fn build_batch(sequences: &[Vec<u32>], pad_id: u32, device: &Device) -> Result<Batch> {
    let rows = sequences.len();
    let width = sequences.iter().map(Vec::len).max().unwrap_or(1).max(1);

    let mut ids = Vec::with_capacity(rows * width);
    let mut mask = Vec::with_capacity(rows * width);
    let mut labels = Vec::with_capacity(rows * width);
    for seq in sequences {
        for idx in 0..width {
            match seq.get(idx) {
                Some(&token) => {
                    ids.push(token as i64);
                    mask.push(1u32);
                    labels.push(token as i64);
                }
                None => {
                    ids.push(pad_id as i64);
                    mask.push(0u32);
                    labels.push(IGNORE_INDEX);
                }
            }
        }
    }

    let input_ids = Tensor::from_vec(ids, (rows, width), device)?;
    let attention_mask = Tensor::from_vec(mask, (rows, width), device)?;
    let labels = Tensor::from_vec(labels, (rows, width), device)?;
    Ok(Batch::from_parts(input_ids, labels, attention_mask))
}

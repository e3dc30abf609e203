use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::models::bpe::{BpeTrainer, BPE};
use tokenizers::models::TrainerWrapper;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::processors::template::TemplateProcessing;
use tokenizers::{AddedToken, Tokenizer};

use crate::errors::{DatasetError, Result};

pub const PAD_TOKEN: &str = "<pad>";
pub const BOS_TOKEN: &str = "<bos>";
pub const EOS_TOKEN: &str = "<eos>";

/// Settings for training a byte-level BPE tokenizer in process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerTrainingConfig {
    pub vocab_size: usize,
    pub min_frequency: u64,
    pub special_tokens: Vec<String>,
    /// Wrap every encoded document in `<bos>` ... `<eos>`.
    pub add_bos: bool,
    pub add_eos: bool,
}

impl Default for TokenizerTrainingConfig {
    fn default() -> Self {
        Self {
            vocab_size: 512,
            min_frequency: 2,
            special_tokens: vec![PAD_TOKEN.into(), BOS_TOKEN.into(), EOS_TOKEN.into()],
            add_bos: true,
            add_eos: true,
        }
    }
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    if !path.is_file() {
        return Err(DatasetError::config(format!(
            "tokenizer json not found at {}",
            path.display()
        )));
    }
    let tokenizer = Tokenizer::from_file(path)?;
    log::info!(
        "loaded tokenizer from {} (vocab={})",
        path.display(),
        tokenizer.get_vocab_size(true)
    );
    Ok(tokenizer)
}

pub fn save_tokenizer(tokenizer: &Tokenizer, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tokenizer.save(path, false)?;
    Ok(())
}

/// Trains a byte-level BPE over `documents`.
///
/// The full byte alphabet is always part of the vocabulary, so text unseen
/// during training still encodes.
pub fn train_tokenizer<I, S>(documents: I, cfg: &TokenizerTrainingConfig) -> Result<Tokenizer>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let documents: Vec<String> = documents
        .into_iter()
        .map(|doc| doc.as_ref().to_string())
        .filter(|doc| !doc.trim().is_empty())
        .collect();
    if documents.is_empty() {
        return Err(DatasetError::config(
            "tokenizer training needs at least one non-empty document",
        ));
    }
    let alphabet = ByteLevel::alphabet();
    let minimum = alphabet.len() + cfg.special_tokens.len();
    if cfg.vocab_size < minimum {
        return Err(DatasetError::config(format!(
            "vocab_size {} is smaller than the byte alphabet plus special tokens ({minimum})",
            cfg.vocab_size
        )));
    }

    let mut tokenizer = Tokenizer::new(BPE::default());
    tokenizer.with_pre_tokenizer(Some(ByteLevel::default()));
    tokenizer.with_decoder(Some(ByteLevel::default()));

    let special_tokens: Vec<AddedToken> = cfg
        .special_tokens
        .iter()
        .cloned()
        .map(|token| AddedToken::from(token, true))
        .collect();

    let mut trainer: TrainerWrapper = BpeTrainer::builder()
        .vocab_size(cfg.vocab_size)
        .min_frequency(cfg.min_frequency)
        .show_progress(false)
        .special_tokens(special_tokens)
        .initial_alphabet(alphabet.into_iter().collect::<std::collections::HashSet<char>>())
        .build()
        .into();

    let count = documents.len();
    tokenizer.train(&mut trainer, documents.into_iter())?;

    if let Some(post) = build_template(&tokenizer, cfg)? {
        tokenizer.with_post_processor(Some(post));
    }

    log::info!(
        "trained tokenizer on {count} document(s) (vocab={})",
        tokenizer.get_vocab_size(true)
    );
    Ok(tokenizer)
}

/// Looks up the id of a token that must be in the vocabulary.
pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| DatasetError::config(format!("token `{token}` is not in the vocabulary")))
}

fn build_template(
    tokenizer: &Tokenizer,
    cfg: &TokenizerTrainingConfig,
) -> Result<Option<TemplateProcessing>> {
    if !cfg.add_bos && !cfg.add_eos {
        return Ok(None);
    }

    let mut single = Vec::new();
    let mut special = Vec::new();
    if cfg.add_bos {
        special.push((BOS_TOKEN.to_string(), token_id(tokenizer, BOS_TOKEN)?));
        single.push(format!("{BOS_TOKEN}:0"));
    }
    single.push("$A:0".to_string());
    if cfg.add_eos {
        special.push((EOS_TOKEN.to_string(), token_id(tokenizer, EOS_TOKEN)?));
        single.push(format!("{EOS_TOKEN}:0"));
    }

    let mut builder = TemplateProcessing::builder();
    builder.try_single(single).map_err(DatasetError::InvalidConfig)?;
    builder.special_tokens(special);
    builder
        .build()
        .map(Some)
        .map_err(|err| DatasetError::config(err.to_string()))
}

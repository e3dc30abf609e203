use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use dataset::{DatasetError, PAD_TOKEN};
use gradients::GradientError;
use model::ModelConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProbeConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProbeError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: ProbeConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ProbeError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProbeError> {
        Self::from_path(path)
    }

    /// Checks every section and reports all problems at once.
    pub fn validate(&self) -> Result<(), ProbeError> {
        let mut errors = Vec::new();

        if let Err(err) = self.model.validate() {
            errors.push(format!("model: {}", err));
        }

        match (&self.tokenizer.tokenizer_json, self.tokenizer.train_vocab_size) {
            (None, None) => errors.push(
                "tokenizer must provide either `tokenizer_json` or `train_vocab_size`".to_string(),
            ),
            (Some(_), Some(_)) => errors.push(
                "tokenizer.tokenizer_json and tokenizer.train_vocab_size are mutually exclusive"
                    .to_string(),
            ),
            _ => {}
        }

        if self.data.shards.is_empty() {
            errors.push("data.shards must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.max_length < 2 {
            errors.push("data.max_length must be at least 2".to_string());
        }

        if self.data.max_length > self.model.block_size {
            errors.push(format!(
                "data.max_length ({}) cannot exceed model.block_size ({})",
                self.data.max_length, self.model.block_size
            ));
        }

        if self.data.text_field.trim().is_empty() {
            errors.push("data.text_field must not be empty".to_string());
        }

        let [first, second] = self.runtime.sample_indices;
        if first == second {
            errors.push("runtime.sample_indices must name two different batches".to_string());
        }

        if self.runtime.device.trim().is_empty() {
            errors.push("runtime.device must not be empty".to_string());
        }

        if self.runtime.freeze.iter().any(|prefix| prefix.is_empty()) {
            errors.push("runtime.freeze entries must not be empty".to_string());
        }

        if self.logging.tensorboard_flush_every_n == 0 {
            errors.push("logging.tensorboard_flush_every_n must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(ProbeError::validation(errors));
        }

        Ok(())
    }

    /// Resolves every relative path in the config against `base`.
    pub fn apply_base_path(&mut self, base: &Path) {
        self.tokenizer.apply_base_path(base);
        self.data.apply_base_path(base);
        self.logging.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
    /// Train a byte-level BPE of this size over the data shards instead of
    /// loading one.
    #[serde(default)]
    pub train_vocab_size: Option<usize>,
    #[serde(default = "default_min_frequency")]
    pub min_frequency: u64,
    /// Where to write a freshly trained tokenizer.
    #[serde(default)]
    pub save_to: Option<PathBuf>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            tokenizer_json: None,
            train_vocab_size: None,
            min_frequency: default_min_frequency(),
            save_to: None,
        }
    }
}

impl TokenizerConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [self.tokenizer_json.as_mut(), self.save_to.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub shards: Vec<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(default = "default_true")]
    pub add_special_tokens: bool,
    #[serde(default = "default_pad_token")]
    pub pad_token: String,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for shard in &mut self.shards {
            absolutize_in_place(shard, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_device")]
    pub device: String,
    /// Seeds model initialisation and batch shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// The two batches whose gradients are compared.
    #[serde(default = "default_sample_indices")]
    pub sample_indices: [usize; 2],
    /// Parameter name prefixes excluded from gradient computation.
    #[serde(default)]
    pub freeze: Vec<String>,
    #[serde(default = "default_true")]
    pub check_accumulation: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            seed: default_seed(),
            sample_indices: default_sample_indices(),
            freeze: Vec::new(),
            check_accumulation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_flush_every(),
            report_path: None,
        }
    }
}

impl LoggingConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [self.tensorboard_dir.as_mut(), self.report_path.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_min_frequency() -> u64 {
    2
}

fn default_batch_size() -> usize {
    1
}

fn default_max_length() -> usize {
    64
}

fn default_text_field() -> String {
    "text".to_string()
}

fn default_pad_token() -> String {
    PAD_TOKEN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_sample_indices() -> [usize; 2] {
    [0, 1]
}

fn default_flush_every() -> usize {
    1
}

#[derive(Debug)]
pub enum ProbeError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    CheckFailed { check: String, keys: Vec<String> },
}

impl ProbeError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn check_failed(check: impl Into<String>, keys: Vec<String>) -> Self {
        Self::CheckFailed {
            check: check.into(),
            keys,
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Io(err) => write!(f, "I/O error: {}", err),
            ProbeError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            ProbeError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            ProbeError::Initialization(msg) => write!(f, "probe initialization failed: {}", msg),
            ProbeError::Runtime(msg) => write!(f, "probe failed: {}", msg),
            ProbeError::CheckFailed { check, keys } if keys.is_empty() => {
                write!(f, "check '{}' failed", check)
            }
            ProbeError::CheckFailed { check, keys } => write!(
                f,
                "check '{}' failed for {} key(s): {}",
                check,
                keys.len(),
                keys.join(", ")
            ),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(value: std::io::Error) -> Self {
        ProbeError::Io(value)
    }
}

impl From<toml::de::Error> for ProbeError {
    fn from(value: toml::de::Error) -> Self {
        ProbeError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(value: serde_json::Error) -> Self {
        ProbeError::ConfigFormat(value.to_string())
    }
}

impl From<DatasetError> for ProbeError {
    fn from(value: DatasetError) -> Self {
        ProbeError::Initialization(value.to_string())
    }
}

impl From<GradientError> for ProbeError {
    fn from(value: GradientError) -> Self {
        ProbeError::Runtime(value.to_string())
    }
}

impl From<candle_core::Error> for ProbeError {
    fn from(value: candle_core::Error) -> Self {
        ProbeError::Runtime(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [tokenizer]
        train_vocab_size = 300

        [data]
        shards = ["corpus.txt"]
        batch_size = 2

        [logging]
        report_path = "out/report.json"
    "#;

    #[test]
    fn relative_paths_resolve_against_config_dir() -> Result<(), ProbeError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("probe.toml");
        fs::write(&path, MINIMAL)?;

        let config = ProbeConfig::from_path(&path)?;

        assert_eq!(config.data.shards, vec![dir.path().join("corpus.txt")]);
        assert_eq!(
            config.logging.report_path,
            Some(dir.path().join("out/report.json"))
        );
        assert_eq!(config.runtime.device, "cpu");
        assert_eq!(config.runtime.sample_indices, [0, 1]);
        assert_eq!(config.data.text_field, "text");
        Ok(())
    }

    #[test]
    fn validation_collects_every_problem() -> Result<(), ProbeError> {
        let mut config: ProbeConfig = toml::from_str(MINIMAL)?;
        config.tokenizer.train_vocab_size = None;
        config.data.batch_size = 0;
        config.runtime.sample_indices = [3, 3];

        match config.validate() {
            Err(ProbeError::Validation(messages)) => assert_eq!(messages.len(), 3, "{messages:?}"),
            other => panic!("expected validation errors, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn unknown_extension_is_a_format_error() -> Result<(), ProbeError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("probe.yaml");
        fs::write(&path, MINIMAL)?;
        assert!(matches!(
            ProbeConfig::from_path(&path),
            Err(ProbeError::ConfigFormat(_))
        ));
        Ok(())
    }
}

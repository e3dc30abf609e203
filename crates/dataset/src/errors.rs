use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DatasetError {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        DatasetError::InvalidConfig(msg.into())
    }
}

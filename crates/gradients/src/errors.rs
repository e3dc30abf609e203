use thiserror::Error;

pub type Result<T> = std::result::Result<T, GradientError>;

#[derive(Error, Debug)]
pub enum GradientError {
    #[error("invalid model interface: {0}")]
    InvalidModelInterface(String),

    #[error("batch is missing required field `{0}`")]
    MissingBatchField(String),

    #[error("device error for `{device}`: {source}")]
    Device {
        device: String,
        #[source]
        source: candle_core::Error,
    },

    #[error("shape error: {0}")]
    Shape(String),

    #[error("backward pass failed: {0}")]
    Backward(#[source] candle_core::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl GradientError {
    pub fn invalid_model(message: impl Into<String>) -> Self {
        Self::InvalidModelInterface(message.into())
    }

    pub(crate) fn device(device: impl Into<String>, source: candle_core::Error) -> Self {
        Self::Device {
            device: device.into(),
            source,
        }
    }
}

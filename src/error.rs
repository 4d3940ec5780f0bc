use thiserror::Error;

/// Errors raised by losses and the loss registry.
#[derive(Debug, Error)]
pub enum LossError {
    #[error("Last layer must be CRF for use {loss}.")]
    NotCrf { loss: String },

    #[error("predictions carry no producing layer for use {loss}")]
    MissingProvenance { loss: String },

    #[error("unknown loss: {0}")]
    UnknownLoss(String),

    #[error("invalid loss config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, LossError>;

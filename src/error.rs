//! Error types for the Griffin model.

use thiserror::Error;

/// Result type for Griffin operations.
pub type GriffinResult<T> = Result<T, GriffinError>;

/// Errors that can occur during Griffin model operations.
#[derive(Debug, Error)]
pub enum GriffinError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Sampling error
    #[error("Sampling error: {0}")]
    Sampling(String),

    /// Cache kind does not match the layer's temporal block
    #[error("Cache mismatch at layer {layer}: expected {expected}")]
    CacheMismatch { layer: usize, expected: &'static str },

    /// Cache slice does not have one slot per layer
    #[error("Cache has {got} slots, model has {expected} layers")]
    CacheLength { expected: usize, got: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GriffinError {
    /// Create an invalid config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }
}

use rust_tokenizers::error::TokenizerError;
use tch::TchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorParallelError {
    #[error("IO error: {0}")]
    IOError(String),

    #[error("Tch tensor error: {0}")]
    TchError(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid configuration error: {0}")]
    InvalidConfigurationError(String),

    #[error("No valid window: no block length in [1, {window_size}) divides sequence length {sequence_length}")]
    NoValidWindowError {
        sequence_length: i64,
        window_size: i64,
    },

    #[error("Missing backend error: {0}")]
    MissingBackendError(String),

    #[error("Sharding precondition error: {0}")]
    ShardingPreconditionError(String),

    #[error("Value error: {0}")]
    ValueError(String),
}

impl From<std::io::Error> for TensorParallelError {
    fn from(error: std::io::Error) -> Self {
        TensorParallelError::IOError(error.to_string())
    }
}

impl From<TokenizerError> for TensorParallelError {
    fn from(error: TokenizerError) -> Self {
        TensorParallelError::TokenizerError(error.to_string())
    }
}

impl From<TchError> for TensorParallelError {
    fn from(error: TchError) -> Self {
        TensorParallelError::TchError(error.to_string())
    }
}

impl From<serde_json::Error> for TensorParallelError {
    fn from(error: serde_json::Error) -> Self {
        TensorParallelError::SerializationError(error.to_string())
    }
}

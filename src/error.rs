//! Error types for GPT inference.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised while loading a model. No partially loaded model is
/// ever returned alongside one of these.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot open model file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic {0:?}, not a model file")]
    BadMagic([u8; 4]),

    #[error("unsupported model format version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid model config: {0}")]
    InvalidConfig(String),

    #[error("region `{region}` declares {found} values, config requires {expected}")]
    ShapeMismatch {
        region: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("region `{region}` truncated: expected {expected} bytes, read {actual}")]
    Truncated {
        region: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unexpected data after the last tensor region")]
    TrailingData,

    #[error("model vocabulary has {model} entries, tokenizer has {tokenizer}")]
    VocabularyMismatch { model: usize, tokenizer: usize },
}

#[derive(Error, Debug)]
pub enum GptError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("sequence of {len} tokens exceeds the context length {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("temperature must be > 0, got {0}")]
    InvalidTemperature(f32),

    #[error("token {token} is outside the vocabulary of {vocab_size}")]
    InvalidToken { token: u32, vocab_size: usize },

    #[error("prompt must contain at least one token")]
    EmptyPrompt,

    #[error("invalid sampling parameter: {0}")]
    InvalidSampling(String),
}

pub type Result<T> = std::result::Result<T, GptError>;

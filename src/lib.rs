//! GPT inference library in Rust
//!
//! A small decoder-only transformer: byte-level tokenizer, tied-embedding
//! forward pass, temperature sampling and an autoregressive generation loop.

pub mod config;
pub mod engine;
pub mod error;
pub mod generate;
pub mod model;
pub mod ops;
pub mod sample;
pub mod state;
pub mod tokenizer;
pub mod weights;

pub use config::{GptConfig, PositionalEncoding};
pub use engine::{Completion, Engine, GenerationParams};
pub use error::{GptError, LoadError, Result};
pub use generate::{Generation, Generator, StopReason, generate};
pub use model::{Model, forward, load_model, read_model, write_model};
pub use sample::{Sampler, sample};
pub use state::GptState;
pub use tokenizer::{EOS_TOKEN, Token, Tokenizer, UNK_TOKEN};
pub use weights::{GptWeights, LayerWeights};

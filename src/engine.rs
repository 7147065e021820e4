//! Text-in, text-out interface over a shared model.

use crate::error::{LoadError, Result};
use crate::generate::{Generator, StopReason};
use crate::model::{Model, load_model};
use crate::sample::Sampler;
use crate::tokenizer::{EOS_TOKEN, Token, Tokenizer, UNK_TOKEN};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Per-request generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Maximum number of tokens to sample
    pub max_new_tokens: usize,
    /// Softmax temperature, must be > 0
    pub temperature: f32,
    /// Keep only the k most likely tokens
    pub top_k: Option<usize>,
    /// Nucleus sampling mass
    pub top_p: Option<f32>,
    /// 1.0 disables the penalty
    pub repetition_penalty: f32,
    /// Seed for the sampler; drawn from the OS when absent
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        GenerationParams {
            max_new_tokens: 256,
            temperature: 0.7,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn new(max_new_tokens: usize, temperature: f32) -> Self {
        GenerationParams {
            max_new_tokens,
            temperature,
            ..Default::default()
        }
    }

    /// Build the sampler, rejecting invalid values.
    pub fn sampler(&self) -> Result<Sampler> {
        let mut sampler = Sampler::new(self.temperature)?;
        if let Some(k) = self.top_k {
            sampler = sampler.with_top_k(k)?;
        }
        if let Some(p) = self.top_p {
            sampler = sampler.with_top_p(p)?;
        }
        sampler.with_repetition_penalty(self.repetition_penalty)
    }
}

/// Result of one text generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Generated continuation, without the prompt
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub stop: StopReason,
}

/// Shared, read-only model and tokenizer. Cloning is cheap, and every clone
/// can serve requests from its own thread.
#[derive(Debug, Clone)]
pub struct Engine {
    model: Arc<Model>,
    tokenizer: Arc<Tokenizer>,
}

impl Engine {
    /// Load a model file and pair it with the default tokenizer.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let model = load_model(path)?;
        let tokenizer = Tokenizer::new(model.config().seq_len);
        Self::new(model, tokenizer)
    }

    pub fn new(model: Model, tokenizer: Tokenizer) -> Result<Self> {
        if model.config().vocab_size != tokenizer.vocab_size() {
            return Err(LoadError::VocabularyMismatch {
                model: model.config().vocab_size,
                tokenizer: tokenizer.vocab_size(),
            }
            .into());
        }
        Ok(Engine {
            model: Arc::new(model),
            tokenizer: Arc::new(tokenizer),
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        self.tokenizer.encode(text.as_bytes())
    }

    pub fn detokenize(&self, tokens: &[Token]) -> String {
        self.tokenizer.decode(tokens)
    }

    /// Generate a continuation of `prompt` with plain temperature sampling.
    pub fn generate(&self, prompt: &str, max_tokens: usize, temperature: f32) -> Result<String> {
        self.generate_with(prompt, &GenerationParams::new(max_tokens, temperature))
            .map(|c| c.text)
    }

    /// Generate a continuation of `prompt` with full parameters.
    pub fn generate_with(&self, prompt: &str, params: &GenerationParams) -> Result<Completion> {
        self.generate_streaming(prompt, params, |_| {})
    }

    /// Generate, calling `on_text` with the text of every sampled token.
    #[instrument(skip(self, prompt, params, on_text), fields(prompt_bytes = prompt.len()))]
    pub fn generate_streaming<F: FnMut(&str)>(
        &self,
        prompt: &str,
        params: &GenerationParams,
        mut on_text: F,
    ) -> Result<Completion> {
        let sampler = params.sampler()?;

        let (mut prompt_tokens, consumed) = self.tokenizer.encode_prefix(prompt.as_bytes());
        if consumed < prompt.len() {
            warn!(
                consumed,
                total = prompt.len(),
                "prompt truncated to the context length"
            );
        }
        let unknown = prompt_tokens.iter().filter(|&&t| t == UNK_TOKEN).count();
        if unknown > 0 {
            warn!(unknown, "prompt contains unmappable bytes");
        }
        if prompt_tokens.is_empty() {
            prompt_tokens.push(EOS_TOKEN);
        }

        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let tokenizer = &self.tokenizer;
        let generation = Generator::new(&self.model, sampler).run_streaming(
            &prompt_tokens,
            params.max_new_tokens,
            &mut rng,
            |token| on_text(&tokenizer.decode_token(token)),
        )?;

        let completion = Completion {
            text: tokenizer.decode(generation.generated()),
            prompt_tokens: generation.prompt_len,
            completion_tokens: generation.generated().len(),
            stop: generation.stop,
        };
        info!(
            stop = ?completion.stop,
            prompt_tokens = completion.prompt_tokens,
            completion_tokens = completion.completion_tokens,
            "generation complete"
        );
        Ok(completion)
    }
}

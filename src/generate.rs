//! Autoregressive generation loop.

use crate::error::Result;
use crate::model::{Model, forward};
use crate::sample::Sampler;
use crate::state::GptState;
use crate::tokenizer::{EOS_TOKEN, Token};
use rand::Rng;
use tracing::debug;

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The sampler produced the end-of-sequence token.
    Eos,
    /// `max_new_tokens` tokens were produced.
    MaxTokens,
    /// The sequence reached the model's context length.
    ContextFull,
}

/// A finished generation: prompt followed by the sampled continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub tokens: Vec<Token>,
    pub prompt_len: usize,
    pub stop: StopReason,
}

impl Generation {
    /// Tokens produced after the prompt, including a final EOS if sampled.
    pub fn generated(&self) -> &[Token] {
        &self.tokens[self.prompt_len..]
    }
}

/// Drives the forward pass and sampler one token at a time. Each call to
/// [`Generator::run`] owns its own sequence and working memory.
#[derive(Debug, Clone)]
pub struct Generator<'m> {
    model: &'m Model,
    sampler: Sampler,
    eos: Token,
}

impl<'m> Generator<'m> {
    pub fn new(model: &'m Model, sampler: Sampler) -> Self {
        Generator {
            model,
            sampler,
            eos: EOS_TOKEN,
        }
    }

    /// Use a different stop token.
    pub fn with_eos(mut self, eos: Token) -> Self {
        self.eos = eos;
        self
    }

    /// Generate up to `max_new_tokens` tokens after `prompt`.
    pub fn run<R: Rng + ?Sized>(
        &self,
        prompt: &[Token],
        max_new_tokens: usize,
        rng: &mut R,
    ) -> Result<Generation> {
        self.run_streaming(prompt, max_new_tokens, rng, |_| {})
    }

    /// Like [`Generator::run`], calling `on_token` with every sampled token.
    pub fn run_streaming<R, F>(
        &self,
        prompt: &[Token],
        max_new_tokens: usize,
        rng: &mut R,
        mut on_token: F,
    ) -> Result<Generation>
    where
        R: Rng + ?Sized,
        F: FnMut(Token),
    {
        self.model.validate_tokens(prompt)?;

        let config = self.model.config();
        let max_len = config.seq_len;
        let capacity = max_len.min(prompt.len().saturating_add(max_new_tokens));
        let mut tokens = Vec::with_capacity(capacity);
        tokens.extend_from_slice(prompt);
        let mut state = GptState::new(config);
        let mut produced = 0;

        let stop = loop {
            if produced == max_new_tokens {
                break StopReason::MaxTokens;
            }
            if tokens.len() >= max_len {
                break StopReason::ContextFull;
            }

            forward(&tokens, config, &mut state, self.model.weights());
            let next = self.sampler.sample(&mut state.logits, &tokens, rng);
            debug!(step = produced, token = next, len = tokens.len() + 1, "sampled");

            tokens.push(next);
            produced += 1;
            on_token(next);

            if next == self.eos {
                break StopReason::Eos;
            }
        };

        debug!(?stop, generated = produced, "generation finished");
        Ok(Generation {
            tokens,
            prompt_len: prompt.len(),
            stop,
        })
    }
}

/// Generate from `prompt_tokens` with plain temperature sampling, returning
/// the prompt followed by the continuation.
pub fn generate<R: Rng + ?Sized>(
    model: &Model,
    prompt_tokens: &[Token],
    max_new_tokens: usize,
    temperature: f32,
    rng: &mut R,
) -> Result<Vec<Token>> {
    let sampler = Sampler::new(temperature)?;
    Generator::new(model, sampler)
        .run(prompt_tokens, max_new_tokens, rng)
        .map(|g| g.tokens)
}

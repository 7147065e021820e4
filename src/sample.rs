//! Token sampling with temperature, top-k, top-p and repetition penalty.

use crate::error::{GptError, Result};
use crate::ops::softmax;
use crate::tokenizer::Token;
use rand::Rng;

/// Used for sorting probabilities in top-k / top-p filtering.
#[derive(Clone, Copy)]
struct ProbIndex {
    prob: f32,
    index: usize,
}

/// Sample one token from `logits` at `temperature`. `logits` is overwritten
/// with the probability distribution.
pub fn sample<R: Rng + ?Sized>(logits: &mut [f32], temperature: f32, rng: &mut R) -> Result<Token> {
    to_probabilities(logits, temperature)?;
    let draw: f32 = rng.random();
    Ok(pick(logits, draw))
}

/// Scale by `1 / temperature` and normalize in-place.
pub fn to_probabilities(logits: &mut [f32], temperature: f32) -> Result<()> {
    check_temperature(temperature)?;
    for l in logits.iter_mut() {
        *l /= temperature;
    }
    softmax(logits);
    Ok(())
}

fn check_temperature(temperature: f32) -> Result<()> {
    if temperature > 0.0 {
        Ok(())
    } else {
        Err(GptError::InvalidTemperature(temperature))
    }
}

/// Walk the cumulative distribution until it reaches `draw`. Entries with no
/// probability are never chosen; if rounding leaves the sum below `draw`,
/// the last candidate wins.
pub fn pick(probs: &[f32], draw: f32) -> Token {
    let mut cdf = 0.0f32;
    let mut last = probs.len().saturating_sub(1);
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cdf += p;
        last = i;
        if cdf >= draw {
            return i as Token;
        }
    }
    last as Token
}

/// Configured sampler. Filters are applied in order: repetition penalty,
/// temperature, top-k, top-p.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    temperature: f32,
    top_k: Option<usize>,
    top_p: Option<f32>,
    repetition_penalty: f32,
}

impl Sampler {
    /// Plain temperature sampling.
    pub fn new(temperature: f32) -> Result<Self> {
        check_temperature(temperature)?;
        Ok(Sampler {
            temperature,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
        })
    }

    /// Keep only the `k` most likely tokens. `k` must be at least 1.
    pub fn with_top_k(mut self, k: usize) -> Result<Self> {
        if k == 0 {
            return Err(GptError::InvalidSampling("top_k must be >= 1".into()));
        }
        self.top_k = Some(k);
        Ok(self)
    }

    /// Keep the smallest set of tokens whose mass exceeds `p`, with `0 < p <= 1`.
    pub fn with_top_p(mut self, p: f32) -> Result<Self> {
        if !(p > 0.0 && p <= 1.0) {
            return Err(GptError::InvalidSampling(format!(
                "top_p must be in (0, 1], got {}",
                p
            )));
        }
        self.top_p = Some(p);
        Ok(self)
    }

    /// Penalize tokens already present in the sequence; 1.0 disables it.
    pub fn with_repetition_penalty(mut self, penalty: f32) -> Result<Self> {
        if !(penalty > 0.0 && penalty.is_finite()) {
            return Err(GptError::InvalidSampling(format!(
                "repetition_penalty must be positive, got {}",
                penalty
            )));
        }
        self.repetition_penalty = penalty;
        Ok(self)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Turn logits into the filtered, normalized distribution in-place.
    pub fn distribution(&self, logits: &mut [f32], history: &[Token]) {
        if self.repetition_penalty != 1.0 {
            apply_repetition_penalty(logits, history, self.repetition_penalty);
        }
        for l in logits.iter_mut() {
            *l /= self.temperature;
        }
        softmax(logits);

        if self.top_k.is_none() && self.top_p.is_none() {
            return;
        }

        let mut prob_index: Vec<ProbIndex> = logits
            .iter()
            .enumerate()
            .map(|(i, &p)| ProbIndex { prob: p, index: i })
            .collect();

        // Sort descending by probability
        prob_index.sort_by(|a, b| {
            b.prob
                .partial_cmp(&a.prob)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut keep = self.top_k.unwrap_or(prob_index.len()).min(prob_index.len());

        if let Some(top_p) = self.top_p {
            let mut cum_prob = 0.0f32;
            for (i, pi) in prob_index.iter().take(keep).enumerate() {
                cum_prob += pi.prob;
                if cum_prob >= top_p {
                    keep = i + 1;
                    break;
                }
            }
        }

        let kept_mass: f32 = prob_index[..keep].iter().map(|pi| pi.prob).sum();
        for pi in &prob_index[keep..] {
            logits[pi.index] = 0.0;
        }
        if kept_mass > 0.0 {
            for pi in &prob_index[..keep] {
                logits[pi.index] /= kept_mass;
            }
        }
    }

    /// Sample a token; `history` is the sequence so far.
    pub fn sample<R: Rng + ?Sized>(&self, logits: &mut [f32], history: &[Token], rng: &mut R) -> Token {
        self.distribution(logits, history);
        let draw: f32 = rng.random();
        pick(logits, draw)
    }
}

/// Divide positive logits and multiply negative ones for every seen token.
fn apply_repetition_penalty(logits: &mut [f32], history: &[Token], penalty: f32) {
    let mut seen = vec![false; logits.len()];
    for &t in history {
        if let Some(flag) = seen.get_mut(t as usize) {
            *flag = true;
        }
    }
    for (l, _) in logits.iter_mut().zip(seen).filter(|(_, s)| *s) {
        if *l > 0.0 {
            *l /= penalty;
        } else {
            *l *= penalty;
        }
    }
}

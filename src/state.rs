//! Per-request working memory for the forward pass.
//!
//! Every generation request owns one [`GptState`]; nothing here is shared
//! between requests.

use crate::config::GptConfig;

/// Scratch buffers. Sequence buffers grow to the longest sequence run
/// through them, never to the full context window up front.
#[derive(Debug, Clone, Default)]
pub struct GptState {
    /// Hidden states `[len][dim]`
    pub x: Vec<f32>,
    /// Normalized hidden states `[len][dim]`
    pub xb: Vec<f32>,
    /// Projection output `[len][dim]`
    pub xb2: Vec<f32>,
    /// Queries `[len][dim]`
    pub q: Vec<f32>,
    /// Keys `[len][dim]`
    pub k: Vec<f32>,
    /// Values `[len][dim]`
    pub v: Vec<f32>,
    /// Concatenated head outputs `[len][dim]`
    pub att_out: Vec<f32>,
    /// Feed-forward activations `[len][4 * dim]`
    pub hb: Vec<f32>,
    /// Final normalized hidden vector `[dim]`
    pub last: Vec<f32>,
    /// Output logits `[vocab_size]`
    pub logits: Vec<f32>,
}

impl GptState {
    /// Allocate the per-step buffers for `config`; sequence buffers start empty.
    pub fn new(config: &GptConfig) -> Self {
        GptState {
            last: vec![0.0; config.dim],
            logits: vec![0.0; config.vocab_size],
            ..Default::default()
        }
    }

    /// Make room for a sequence of `len` tokens under `config`. Any state,
    /// including one built for another config, can be reused this way.
    pub fn prepare(&mut self, config: &GptConfig, len: usize) {
        let rows = len * config.dim;
        for buf in [
            &mut self.x,
            &mut self.xb,
            &mut self.xb2,
            &mut self.q,
            &mut self.k,
            &mut self.v,
            &mut self.att_out,
        ] {
            grow(buf, rows);
        }
        grow(&mut self.hb, len * config.ffn_dim());
        self.last.resize(config.dim, 0.0);
        self.logits.resize(config.vocab_size, 0.0);
    }
}

fn grow(buf: &mut Vec<f32>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0.0);
    }
}

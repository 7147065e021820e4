//! GPT model loading and forward pass.

use crate::config::{FORMAT_VERSION, GptConfig, MAGIC, PositionalEncoding};
use crate::error::{GptError, LoadError, Result};
use crate::ops::{
    accum, add_sinusoidal, dot, gelu_inplace, layer_norm, layer_norm_rows, matmul, matvec_rows,
    softmax,
};
use crate::state::GptState;
use crate::tokenizer::Token;
use crate::weights::{GptWeights, LayerWeights, read_bytes};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

/// Header size: magic, version and six u32 config fields.
const HEADER_LEN: usize = 4 + 4 + 6 * 4;

/// Configuration plus weights. Read-only once built, so one instance can
/// serve any number of concurrent requests.
#[derive(Debug, Clone)]
pub struct Model {
    config: GptConfig,
    weights: GptWeights,
}

impl Model {
    /// Pair weights with the config they were built for.
    pub fn new(config: GptConfig, weights: GptWeights) -> std::result::Result<Self, LoadError> {
        config.validate()?;
        let dim = config.dim;
        let layers_match = weights.layers().len() == config.n_layers
            && weights
                .layers()
                .iter()
                .all(|l| l.wq().len() == dim * dim && l.w_up().len() == dim * config.ffn_dim());
        let position_matches = match config.positional {
            PositionalEncoding::Learned => weights.position().map(<[f32]>::len) == config.position_len(),
            _ => weights.position().is_none(),
        };
        if weights.embed_tokens().len() != config.vocab_size * dim || !layers_match || !position_matches
        {
            return Err(LoadError::InvalidConfig(format!(
                "weights do not match config {:?}",
                config
            )));
        }
        Ok(Model { config, weights })
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    pub fn weights(&self) -> &GptWeights {
        &self.weights
    }

    /// Check a token sequence before running it.
    pub fn validate_tokens(&self, tokens: &[Token]) -> Result<()> {
        if tokens.is_empty() {
            return Err(GptError::EmptyPrompt);
        }
        if tokens.len() > self.config.seq_len {
            return Err(GptError::SequenceTooLong {
                len: tokens.len(),
                max: self.config.seq_len,
            });
        }
        if let Some(&token) = tokens
            .iter()
            .find(|&&t| t as usize >= self.config.vocab_size)
        {
            return Err(GptError::InvalidToken {
                token,
                vocab_size: self.config.vocab_size,
            });
        }
        Ok(())
    }

    /// Logits for the token following `tokens`, computed in `state`. The
    /// state is resized as needed, so one built for another model works too.
    pub fn forward<'s>(&self, tokens: &[Token], state: &'s mut GptState) -> Result<&'s [f32]> {
        self.validate_tokens(tokens)?;
        Ok(forward(tokens, &self.config, state, &self.weights))
    }

    /// Logits for the token following `tokens`, using fresh working memory.
    pub fn logits(&self, tokens: &[Token]) -> Result<Vec<f32>> {
        let mut state = GptState::new(&self.config);
        self.forward(tokens, &mut state).map(<[f32]>::to_vec)
    }

    /// Write the model file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), LoadError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| LoadError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        write_model(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Load config and weights from a model file.
pub fn load_model<P: AsRef<Path>>(path: P) -> std::result::Result<Model, LoadError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| LoadError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let model = read_model(&mut reader)?;

    info!(
        path = %path.display(),
        dim = model.config.dim,
        layers = model.config.n_layers,
        heads = model.config.n_heads,
        vocab = model.config.vocab_size,
        seq_len = model.config.seq_len,
        params = model.weights.param_count(),
        "loaded model"
    );
    Ok(model)
}

/// Read a model from any byte source.
pub fn read_model<R: Read>(reader: &mut R) -> std::result::Result<Model, LoadError> {
    let header = read_bytes(reader, "header", HEADER_LEN)?;

    let magic = [header[0], header[1], header[2], header[3]];
    if magic != MAGIC {
        return Err(LoadError::BadMagic(magic));
    }
    let version = LittleEndian::read_u32(&header[4..8]);
    if version != FORMAT_VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }

    let mut fields = [0u32; 6];
    LittleEndian::read_u32_into(&header[8..], &mut fields);
    let positional = PositionalEncoding::from_code(fields[5]).ok_or_else(|| {
        LoadError::InvalidConfig(format!("unknown positional encoding {}", fields[5]))
    })?;

    let config = GptConfig {
        vocab_size: fields[0] as usize,
        dim: fields[1] as usize,
        n_layers: fields[2] as usize,
        n_heads: fields[3] as usize,
        seq_len: fields[4] as usize,
        positional,
    };
    config.validate()?;

    let weights = GptWeights::load(reader, &config)?;
    Ok(Model { config, weights })
}

/// Write the header and weight regions.
pub fn write_model<W: Write>(writer: &mut W, model: &Model) -> std::io::Result<()> {
    let c = &model.config;
    let field = |v: usize| {
        u32::try_from(v).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("config value {} does not fit the header", v),
            )
        })
    };

    writer.write_all(&MAGIC)?;
    writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    for v in [c.vocab_size, c.dim, c.n_layers, c.n_heads, c.seq_len] {
        writer.write_u32::<LittleEndian>(field(v)?)?;
    }
    writer.write_u32::<LittleEndian>(c.positional.code())?;
    model.weights.write(writer)
}

/// Full-sequence forward pass. `tokens` must be non-empty, no longer than
/// `seq_len`, and inside the vocabulary; returns logits for the next token.
pub fn forward<'s>(
    tokens: &[Token],
    config: &GptConfig,
    state: &'s mut GptState,
    weights: &GptWeights,
) -> &'s [f32] {
    let dim = config.dim;
    let n = tokens.len();
    state.prepare(config, n);

    // Token embedding plus position
    for (pos, &token) in tokens.iter().enumerate() {
        let emb_offset = token as usize * dim;
        let row = &mut state.x[pos * dim..(pos + 1) * dim];
        row.copy_from_slice(&weights.embed_tokens()[emb_offset..emb_offset + dim]);
        match (config.positional, weights.position()) {
            (PositionalEncoding::Sinusoidal, _) => add_sinusoidal(row, pos),
            (PositionalEncoding::Learned, Some(table)) => {
                accum(row, &table[pos * dim..(pos + 1) * dim])
            }
            _ => {}
        }
    }

    for layer in weights.layers() {
        attention(n, config, state, layer);
        feed_forward(n, config, state, layer);
    }

    // Final norm on the last position
    layer_norm(&mut state.last, &state.x[(n - 1) * dim..n * dim]);

    // Logits (tied embeddings)
    matvec_rows(&mut state.logits, &state.last, weights.embed_tokens());
    &state.logits
}

/// Causal multi-head self-attention with a pre-norm residual.
fn attention(n: usize, config: &GptConfig, state: &mut GptState, layer: &LayerWeights) {
    let dim = config.dim;
    let rows = n * dim;
    let head_dim = config.head_dim();
    let scale = 1.0 / (head_dim as f32).sqrt();

    layer_norm_rows(&mut state.xb[..rows], &state.x[..rows], dim);

    matmul(&mut state.q[..rows], &state.xb[..rows], layer.wq(), dim, dim);
    matmul(&mut state.k[..rows], &state.xb[..rows], layer.wk(), dim, dim);
    matmul(&mut state.v[..rows], &state.xb[..rows], layer.wv(), dim, dim);

    let q = &state.q[..rows];
    let k = &state.k[..rows];
    let v = &state.v[..rows];

    let head_outputs: Vec<Vec<f32>> = (0..config.n_heads)
        .into_par_iter()
        .map(|h| {
            let h_off = h * head_dim;
            let mut out = vec![0.0f32; n * head_dim];
            let mut att = vec![0.0f32; n];

            for i in 0..n {
                let qi = &q[i * dim + h_off..i * dim + h_off + head_dim];

                // Position i sees positions 0..=i
                let scores = &mut att[..=i];
                for (t, s) in scores.iter_mut().enumerate() {
                    let kt = &k[t * dim + h_off..t * dim + h_off + head_dim];
                    *s = dot(qi, kt) * scale;
                }
                softmax(scores);

                let oi = &mut out[i * head_dim..(i + 1) * head_dim];
                for (t, &a) in scores.iter().enumerate() {
                    let vt = &v[t * dim + h_off..t * dim + h_off + head_dim];
                    for (o, &vv) in oi.iter_mut().zip(vt.iter()) {
                        *o += a * vv;
                    }
                }
            }
            out
        })
        .collect();

    for (h, out) in head_outputs.iter().enumerate() {
        for i in 0..n {
            let dst = i * dim + h * head_dim;
            state.att_out[dst..dst + head_dim]
                .copy_from_slice(&out[i * head_dim..(i + 1) * head_dim]);
        }
    }

    matmul(&mut state.xb2[..rows], &state.att_out[..rows], layer.wo(), dim, dim);
    accum(&mut state.x[..rows], &state.xb2[..rows]);
}

/// Feed-forward block with a pre-norm residual.
fn feed_forward(n: usize, config: &GptConfig, state: &mut GptState, layer: &LayerWeights) {
    let dim = config.dim;
    let fdim = config.ffn_dim();
    let rows = n * dim;
    let hrows = n * fdim;

    layer_norm_rows(&mut state.xb[..rows], &state.x[..rows], dim);
    matmul(&mut state.hb[..hrows], &state.xb[..rows], layer.w_up(), dim, fdim);
    gelu_inplace(&mut state.hb[..hrows]);
    matmul(&mut state.xb2[..rows], &state.hb[..hrows], layer.w_down(), fdim, dim);
    accum(&mut state.x[..rows], &state.xb2[..rows]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::gelu;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn tiny_config(positional: PositionalEncoding) -> GptConfig {
        GptConfig {
            vocab_size: 11,
            dim: 8,
            n_layers: 2,
            n_heads: 2,
            seq_len: 6,
            positional,
        }
    }

    fn tiny_model(positional: PositionalEncoding, seed: u64) -> Model {
        build(tiny_config(positional), seed)
    }

    fn one_layer_model(positional: PositionalEncoding, seed: u64) -> Model {
        build(
            GptConfig {
                n_layers: 1,
                ..tiny_config(positional)
            },
            seed,
        )
    }

    fn build(config: GptConfig, seed: u64) -> Model {
        let weights = GptWeights::random(&config, &mut StdRng::seed_from_u64(seed)).unwrap();
        Model::new(config, weights).unwrap()
    }

    fn ln(x: &[f32]) -> Vec<f32> {
        let n = x.len() as f32;
        let mean = x.iter().sum::<f32>() / n;
        let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        x.iter().map(|v| (v - mean) / (var + 1e-5).sqrt()).collect()
    }

    fn vecmat(x: &[f32], w: &[f32], out_dim: usize) -> Vec<f32> {
        let mut out = vec![0.0; out_dim];
        for (i, xi) in x.iter().enumerate() {
            for j in 0..out_dim {
                out[j] += xi * w[i * out_dim + j];
            }
        }
        out
    }

    /// Plain scalar transformer used as the numeric reference.
    fn reference_logits(model: &Model, tokens: &[Token]) -> Vec<f32> {
        let c = model.config();
        let w = model.weights();
        let (dim, hd) = (c.dim, c.head_dim());

        let mut x: Vec<Vec<f32>> = tokens
            .iter()
            .enumerate()
            .map(|(pos, &t)| {
                let mut row = w.embed_tokens()[t as usize * dim..(t as usize + 1) * dim].to_vec();
                if c.positional == PositionalEncoding::Sinusoidal {
                    for i in (0..dim).step_by(2) {
                        let angle = pos as f32 / 10000f32.powf(i as f32 / dim as f32);
                        row[i] += angle.sin();
                        row[i + 1] += angle.cos();
                    }
                }
                row
            })
            .collect();

        for layer in w.layers() {
            let xn: Vec<Vec<f32>> = x.iter().map(|r| ln(r)).collect();
            let q: Vec<Vec<f32>> = xn.iter().map(|r| vecmat(r, layer.wq(), dim)).collect();
            let k: Vec<Vec<f32>> = xn.iter().map(|r| vecmat(r, layer.wk(), dim)).collect();
            let v: Vec<Vec<f32>> = xn.iter().map(|r| vecmat(r, layer.wv(), dim)).collect();
            for i in 0..x.len() {
                let mut att_out = vec![0.0; dim];
                for h in 0..c.n_heads {
                    let r = h * hd..(h + 1) * hd;
                    let scores: Vec<f32> = (0..=i)
                        .map(|t| {
                            q[i][r.clone()]
                                .iter()
                                .zip(&k[t][r.clone()])
                                .map(|(a, b)| a * b)
                                .sum::<f32>()
                                / (hd as f32).sqrt()
                        })
                        .collect();
                    let m = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let e: Vec<f32> = scores.iter().map(|s| (s - m).exp()).collect();
                    let z: f32 = e.iter().sum();
                    for t in 0..=i {
                        for j in r.clone() {
                            att_out[j] += e[t] / z * v[t][j];
                        }
                    }
                }
                let proj = vecmat(&att_out, layer.wo(), dim);
                for j in 0..dim {
                    x[i][j] += proj[j];
                }
            }
            for row in x.iter_mut() {
                let mut hidden = vecmat(&ln(row), layer.w_up(), c.ffn_dim());
                hidden.iter_mut().for_each(|h| *h = gelu(*h));
                let down = vecmat(&hidden, layer.w_down(), dim);
                for j in 0..dim {
                    row[j] += down[j];
                }
            }
        }

        let last = ln(x.last().unwrap());
        w.embed_tokens()
            .chunks(dim)
            .map(|e| e.iter().zip(&last).map(|(a, b)| a * b).sum())
            .collect()
    }

    #[test]
    fn test_forward_matches_scalar_reference() {
        let model = tiny_model(PositionalEncoding::Sinusoidal, 3);
        let tokens = [4, 7, 1, 10, 0];
        let logits = model.logits(&tokens).unwrap();
        let expected = reference_logits(&model, &tokens);
        assert_eq!(logits.len(), 11);
        for (a, b) in logits.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_forward_is_deterministic_across_states() {
        let model = tiny_model(PositionalEncoding::Sinusoidal, 5);
        let mut s1 = GptState::new(model.config());
        let mut s2 = GptState::new(model.config());
        // Dirty s2 with a longer sequence first.
        model.forward(&[1, 2, 3, 4, 5, 6], &mut s2).unwrap();
        let a = model.forward(&[3, 9], &mut s1).unwrap().to_vec();
        let b = model.forward(&[3, 9], &mut s2).unwrap().to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn test_attention_is_causal() {
        let model = tiny_model(PositionalEncoding::Sinusoidal, 11);
        let dim = model.config().dim;
        let mut short = GptState::new(model.config());
        let mut long = GptState::new(model.config());
        model.forward(&[2, 5], &mut short).unwrap();
        model.forward(&[2, 5, 8, 1], &mut long).unwrap();
        for (a, b) in short.x[..2 * dim].iter().zip(&long.x[..2 * dim]) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_position_signal_breaks_permutation_symmetry() {
        // One layer: the last position attends to an unordered set of rows.
        let plain = one_layer_model(PositionalEncoding::None, 21);
        let a = plain.logits(&[3, 6, 9]).unwrap();
        let b = plain.logits(&[6, 3, 9]).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4);
        }

        let positioned = one_layer_model(PositionalEncoding::Sinusoidal, 21);
        let a = positioned.logits(&[3, 6, 9]).unwrap();
        let b = positioned.logits(&[6, 3, 9]).unwrap();
        assert!(a.iter().zip(&b).any(|(x, y)| (x - y).abs() > 1e-4));
    }

    #[test]
    fn test_learned_positions() {
        let model = one_layer_model(PositionalEncoding::Learned, 8);
        assert!(model.weights().position().is_some());
        let a = model.logits(&[3, 6, 9]).unwrap();
        let b = model.logits(&[6, 3, 9]).unwrap();
        assert!(a.iter().zip(&b).any(|(x, y)| (x - y).abs() > 1e-6));
    }

    #[test]
    fn test_validate_tokens() {
        let model = tiny_model(PositionalEncoding::Sinusoidal, 1);
        assert!(matches!(model.logits(&[]), Err(GptError::EmptyPrompt)));
        assert!(matches!(
            model.logits(&[1; 7]),
            Err(GptError::SequenceTooLong { len: 7, max: 6 })
        ));
        assert!(matches!(
            model.logits(&[1, 11]),
            Err(GptError::InvalidToken { token: 11, vocab_size: 11 })
        ));
        assert!(model.logits(&[1; 6]).is_ok());
    }

    #[test]
    fn test_model_roundtrip_through_bytes() {
        let model = tiny_model(PositionalEncoding::Learned, 4);
        let mut buf = Vec::new();
        write_model(&mut buf, &model).unwrap();
        assert_eq!(&buf[..4], b"GPTW");

        let loaded = read_model(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.config(), model.config());
        assert_eq!(loaded.logits(&[1, 2]).unwrap(), model.logits(&[1, 2]).unwrap());
    }

    #[test]
    fn test_header_errors() {
        let model = tiny_model(PositionalEncoding::None, 4);
        let mut buf = Vec::new();
        write_model(&mut buf, &model).unwrap();

        let mut bad = buf.clone();
        bad[0] = b'X';
        assert!(matches!(read_model(&mut bad.as_slice()), Err(LoadError::BadMagic(_))));

        let mut bad = buf.clone();
        bad[4] = 9;
        assert!(matches!(
            read_model(&mut bad.as_slice()),
            Err(LoadError::UnsupportedVersion(9))
        ));

        assert!(matches!(
            read_model(&mut &buf[..10]),
            Err(LoadError::Truncated { region: "header", .. })
        ));
    }

    #[test]
    fn test_forward_reuses_state_from_smaller_model() {
        let small = build(
            GptConfig {
                vocab_size: 3,
                dim: 2,
                n_layers: 1,
                n_heads: 1,
                seq_len: 2,
                positional: PositionalEncoding::None,
            },
            2,
        );
        let mut state = GptState::new(small.config());
        small.forward(&[1, 2], &mut state).unwrap();

        let model = tiny_model(PositionalEncoding::Sinusoidal, 6);
        let tokens = [5, 1, 9, 2, 7];
        let logits = model.forward(&tokens, &mut state).unwrap().to_vec();
        assert_eq!(logits, model.logits(&tokens).unwrap());
    }

    #[test]
    fn test_header_rejects_oversized_context() {
        let model = tiny_model(PositionalEncoding::Sinusoidal, 4);
        let mut buf = Vec::new();
        write_model(&mut buf, &model).unwrap();
        // seq_len is the fifth config field
        buf[24..28].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            read_model(&mut buf.as_slice()),
            Err(LoadError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_model_new_rejects_mismatched_weights() {
        let config = tiny_config(PositionalEncoding::None);
        let weights = GptWeights::random(&config, &mut StdRng::seed_from_u64(0)).unwrap();
        let other = GptConfig {
            n_layers: 3,
            ..config
        };
        assert!(Model::new(other, weights).is_err());
    }
}

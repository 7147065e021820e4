//! Model weights and their on-disk regions.

use crate::config::{GptConfig, PositionalEncoding};
use crate::error::LoadError;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use rand::Rng;
use std::io::{Read, Write};

type LoadResult<T> = std::result::Result<T, LoadError>;

/// Weights for a single transformer layer. Matrices are `in x out`.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    wq: Vec<f32>,
    wk: Vec<f32>,
    wv: Vec<f32>,
    wo: Vec<f32>,
    w_up: Vec<f32>,
    w_down: Vec<f32>,
}

impl LayerWeights {
    /// Query projection, `dim x dim`.
    pub fn wq(&self) -> &[f32] {
        &self.wq
    }

    /// Key projection, `dim x dim`.
    pub fn wk(&self) -> &[f32] {
        &self.wk
    }

    /// Value projection, `dim x dim`.
    pub fn wv(&self) -> &[f32] {
        &self.wv
    }

    /// Attention output projection, `dim x dim`.
    pub fn wo(&self) -> &[f32] {
        &self.wo
    }

    /// Feed-forward expansion, `dim x 4dim`.
    pub fn w_up(&self) -> &[f32] {
        &self.w_up
    }

    /// Feed-forward contraction, `4dim x dim`.
    pub fn w_down(&self) -> &[f32] {
        &self.w_down
    }
}

/// All model parameters. Immutable after construction.
#[derive(Debug, Clone)]
pub struct GptWeights {
    embed_tokens: Vec<f32>,
    position: Option<Vec<f32>>,
    layers: Vec<LayerWeights>,
}

impl GptWeights {
    /// Build weights from flat regions, checking every length against `config`.
    pub fn from_regions(
        config: &GptConfig,
        embedding: Vec<f32>,
        position: Option<Vec<f32>>,
        attention: Vec<f32>,
        feed_forward: Vec<f32>,
    ) -> LoadResult<Self> {
        config.validate()?;
        let dim = config.dim;
        let fdim = config.ffn_dim();

        check_len("embedding", config.embedding_len(), embedding.len())?;
        let position = match (config.positional, position) {
            (PositionalEncoding::Learned, Some(p)) => {
                check_len("position", config.position_len(), p.len())?;
                Some(p)
            }
            (PositionalEncoding::Learned, None) => {
                return Err(LoadError::ShapeMismatch {
                    region: "position",
                    expected: (config.seq_len * dim) as u64,
                    found: 0,
                });
            }
            (_, Some(p)) => {
                return Err(LoadError::ShapeMismatch {
                    region: "position",
                    expected: 0,
                    found: p.len() as u64,
                });
            }
            (_, None) => None,
        };
        check_len("attention", config.attention_len(), attention.len())?;
        check_len("feed_forward", config.feed_forward_len(), feed_forward.len())?;

        let attn_sq = dim * dim;
        let ffn_sq = dim * fdim;
        let layers = attention
            .chunks_exact(4 * attn_sq)
            .zip(feed_forward.chunks_exact(2 * ffn_sq))
            .map(|(attn, ffn)| LayerWeights {
                wq: attn[..attn_sq].to_vec(),
                wk: attn[attn_sq..2 * attn_sq].to_vec(),
                wv: attn[2 * attn_sq..3 * attn_sq].to_vec(),
                wo: attn[3 * attn_sq..].to_vec(),
                w_up: ffn[..ffn_sq].to_vec(),
                w_down: ffn[ffn_sq..].to_vec(),
            })
            .collect();

        Ok(GptWeights {
            embed_tokens: embedding,
            position,
            layers,
        })
    }

    /// Load weight regions from a binary reader positioned after the header.
    pub fn load<R: Read>(reader: &mut R, config: &GptConfig) -> LoadResult<Self> {
        config.validate()?;

        let embedding = read_region(reader, "embedding", config.embedding_len())?;
        let position = match config.positional {
            PositionalEncoding::Learned => {
                Some(read_region(reader, "position", config.position_len())?)
            }
            _ => None,
        };
        let attention = read_region(reader, "attention", config.attention_len())?;
        let feed_forward = read_region(reader, "feed_forward", config.feed_forward_len())?;

        if reader.by_ref().bytes().next().transpose()?.is_some() {
            return Err(LoadError::TrailingData);
        }

        Self::from_regions(config, embedding, position, attention, feed_forward)
    }

    /// Write weight regions in the layout read by [`GptWeights::load`].
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        write_region(writer, std::iter::once(self.embed_tokens.as_slice()))?;
        if let Some(position) = &self.position {
            write_region(writer, std::iter::once(position.as_slice()))?;
        }
        write_region(
            writer,
            self.layers
                .iter()
                .flat_map(|l| [&l.wq[..], &l.wk[..], &l.wv[..], &l.wo[..]]),
        )?;
        write_region(
            writer,
            self.layers.iter().flat_map(|l| [&l.w_up[..], &l.w_down[..]]),
        )
    }

    /// Uniformly initialized weights, scaled by the fan-in of each matrix.
    pub fn random<R: Rng + ?Sized>(config: &GptConfig, rng: &mut R) -> LoadResult<Self> {
        config.validate()?;
        let dim = config.dim;
        let fdim = config.ffn_dim();
        let mut fill = |n: usize, scale: f32| -> Vec<f32> {
            (0..n).map(|_| rng.random_range(-scale..scale)).collect()
        };

        let dim_scale = 1.0 / (dim as f32).sqrt();
        let embedding = fill(config.vocab_size * dim, 1.0);
        let position = match config.positional {
            PositionalEncoding::Learned => Some(fill(config.seq_len * dim, 0.1)),
            _ => None,
        };
        let mut attention = Vec::with_capacity(config.n_layers * 4 * dim * dim);
        let mut feed_forward = Vec::with_capacity(config.n_layers * 2 * dim * fdim);
        for _ in 0..config.n_layers {
            attention.extend(fill(4 * dim * dim, dim_scale));
            feed_forward.extend(fill(dim * fdim, dim_scale));
            feed_forward.extend(fill(fdim * dim, 1.0 / (fdim as f32).sqrt()));
        }

        Self::from_regions(config, embedding, position, attention, feed_forward)
    }

    /// Token embeddings, `vocab_size x dim`; also the output projection.
    pub fn embed_tokens(&self) -> &[f32] {
        &self.embed_tokens
    }

    /// Learned position table, `seq_len x dim`, if the model has one.
    pub fn position(&self) -> Option<&[f32]> {
        self.position.as_deref()
    }

    pub fn layers(&self) -> &[LayerWeights] {
        &self.layers
    }

    /// Total number of parameters.
    pub fn param_count(&self) -> usize {
        self.embed_tokens.len()
            + self.position.as_ref().map_or(0, Vec::len)
            + self
                .layers
                .iter()
                .map(|l| {
                    l.wq.len() + l.wk.len() + l.wv.len() + l.wo.len() + l.w_up.len() + l.w_down.len()
                })
                .sum::<usize>()
    }
}

fn check_len(region: &'static str, expected: Option<usize>, found: usize) -> LoadResult<()> {
    let expected = expected.ok_or_else(|| LoadError::InvalidConfig("tensor sizes overflow".into()))?;
    if expected != found {
        return Err(LoadError::ShapeMismatch {
            region,
            expected: expected as u64,
            found: found as u64,
        });
    }
    Ok(())
}

/// Read exactly `len` bytes, reporting how many arrived if the reader ends early.
pub(crate) fn read_bytes<R: Read>(reader: &mut R, region: &'static str, len: usize) -> LoadResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(1 << 24));
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() < len {
        return Err(LoadError::Truncated {
            region,
            expected: len,
            actual: buf.len(),
        });
    }
    Ok(buf)
}

/// Read one length-prefixed region of f32 values.
fn read_region<R: Read>(
    reader: &mut R,
    region: &'static str,
    expected: Option<usize>,
) -> LoadResult<Vec<f32>> {
    let expected = expected.ok_or_else(|| LoadError::InvalidConfig("tensor sizes overflow".into()))?;

    let prefix = read_bytes(reader, region, 8)?;
    let declared = LittleEndian::read_u64(&prefix);
    if declared != expected as u64 {
        return Err(LoadError::ShapeMismatch {
            region,
            expected: expected as u64,
            found: declared,
        });
    }

    let byte_len = expected
        .checked_mul(4)
        .ok_or_else(|| LoadError::InvalidConfig(format!("region `{}` too large", region)))?;
    let bytes = read_bytes(reader, region, byte_len)?;

    let mut values = vec![0f32; expected];
    LittleEndian::read_f32_into(&bytes, &mut values);
    Ok(values)
}

/// Write one length-prefixed region made of consecutive slices.
fn write_region<'a, W: Write>(
    writer: &mut W,
    parts: impl Iterator<Item = &'a [f32]> + Clone,
) -> std::io::Result<()> {
    let len: usize = parts.clone().map(<[f32]>::len).sum();
    writer.write_u64::<LittleEndian>(len as u64)?;
    for part in parts {
        for &v in part {
            writer.write_f32::<LittleEndian>(v)?;
        }
    }
    Ok(())
}

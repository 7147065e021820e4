//! GPT model configuration.

use crate::error::LoadError;

/// Model file magic bytes.
pub const MAGIC: [u8; 4] = *b"GPTW";

/// Current model file format version.
pub const FORMAT_VERSION: u32 = 1;

/// Width multiplier of the feed-forward block.
pub const FFN_MULTIPLIER: usize = 4;

/// Longest context a model file may declare.
pub const MAX_SEQ_LEN: usize = 1 << 16;

/// Positional signal added to the token embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionalEncoding {
    /// No positional signal
    None,
    /// Fixed additive sinusoidal encoding
    #[default]
    Sinusoidal,
    /// Learned `seq_len x dim` table stored in the model file
    Learned,
}

impl PositionalEncoding {
    /// Header code for this encoding.
    pub fn code(self) -> u32 {
        match self {
            PositionalEncoding::None => 0,
            PositionalEncoding::Sinusoidal => 1,
            PositionalEncoding::Learned => 2,
        }
    }

    /// Parse a header code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PositionalEncoding::None),
            1 => Some(PositionalEncoding::Sinusoidal),
            2 => Some(PositionalEncoding::Learned),
            _ => None,
        }
    }
}

/// Transformer hyperparameters, shared by the model file writer and reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptConfig {
    /// Vocabulary size (rows of the embedding matrix)
    pub vocab_size: usize,
    /// Embedding dimension
    pub dim: usize,
    /// Number of transformer layers
    pub n_layers: usize,
    /// Number of attention heads
    pub n_heads: usize,
    /// Maximum context length
    pub seq_len: usize,
    /// Positional encoding added after the embedding lookup
    pub positional: PositionalEncoding,
}

impl Default for GptConfig {
    fn default() -> Self {
        GptConfig {
            vocab_size: crate::tokenizer::VOCAB_SIZE,
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            seq_len: 256,
            positional: PositionalEncoding::Sinusoidal,
        }
    }
}

impl GptConfig {
    /// Returns the head size.
    #[inline]
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Returns the feed-forward hidden width.
    #[inline]
    pub fn ffn_dim(&self) -> usize {
        self.dim * FFN_MULTIPLIER
    }

    /// Element count of the embedding matrix.
    pub fn embedding_len(&self) -> Option<usize> {
        self.vocab_size.checked_mul(self.dim)
    }

    /// Element count of the learned position table (zero unless learned).
    pub fn position_len(&self) -> Option<usize> {
        match self.positional {
            PositionalEncoding::Learned => self.seq_len.checked_mul(self.dim),
            _ => Some(0),
        }
    }

    /// Element count of all attention projections across layers.
    pub fn attention_len(&self) -> Option<usize> {
        self.dim
            .checked_mul(self.dim)?
            .checked_mul(4)?
            .checked_mul(self.n_layers)
    }

    /// Element count of all feed-forward matrices across layers.
    pub fn feed_forward_len(&self) -> Option<usize> {
        self.dim
            .checked_mul(self.ffn_dim())?
            .checked_mul(2)?
            .checked_mul(self.n_layers)
    }

    /// Check that the hyperparameters describe a usable model.
    pub fn validate(&self) -> std::result::Result<(), LoadError> {
        let invalid = |msg: String| Err(LoadError::InvalidConfig(msg));

        if self.vocab_size == 0 || self.dim == 0 || self.n_heads == 0 || self.seq_len == 0 {
            return invalid(format!("zero-sized dimension in {:?}", self));
        }
        if self.seq_len > MAX_SEQ_LEN {
            return invalid(format!(
                "seq_len {} exceeds the limit of {}",
                self.seq_len, MAX_SEQ_LEN
            ));
        }
        if self.dim % self.n_heads != 0 {
            return invalid(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            ));
        }
        if self.positional == PositionalEncoding::Sinusoidal && self.dim % 2 != 0 {
            return invalid(format!("sinusoidal encoding needs an even dim, got {}", self.dim));
        }
        if self.dim.checked_mul(FFN_MULTIPLIER).is_none()
            || self.embedding_len().is_none()
            || self.position_len().is_none()
            || self.attention_len().is_none()
            || self.feed_forward_len().is_none()
            || self.seq_len.checked_mul(self.ffn_dim()).is_none()
        {
            return invalid("tensor sizes overflow".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = GptConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.ffn_dim(), 256);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let config = GptConfig {
            dim: 30,
            n_heads: 4,
            ..GptConfig::default()
        };
        assert!(matches!(config.validate(), Err(LoadError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_odd_dim_for_sinusoidal() {
        let config = GptConfig {
            dim: 9,
            n_heads: 3,
            ..GptConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GptConfig {
            positional: PositionalEncoding::None,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_overflow() {
        let config = GptConfig {
            vocab_size: usize::MAX / 2,
            dim: 64,
            ..GptConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_context() {
        let config = GptConfig {
            seq_len: u32::MAX as usize,
            dim: 8,
            n_heads: 2,
            positional: PositionalEncoding::Sinusoidal,
            ..GptConfig::default()
        };
        assert!(matches!(config.validate(), Err(LoadError::InvalidConfig(_))));

        let config = GptConfig {
            seq_len: MAX_SEQ_LEN,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_region_lengths() {
        let config = GptConfig {
            vocab_size: 10,
            dim: 8,
            n_layers: 3,
            n_heads: 2,
            seq_len: 5,
            positional: PositionalEncoding::Learned,
        };
        assert_eq!(config.embedding_len(), Some(80));
        assert_eq!(config.position_len(), Some(40));
        assert_eq!(config.attention_len(), Some(3 * 4 * 64));
        assert_eq!(config.feed_forward_len(), Some(3 * 2 * 8 * 32));
    }

    #[test]
    fn test_positional_codes() {
        for enc in [
            PositionalEncoding::None,
            PositionalEncoding::Sinusoidal,
            PositionalEncoding::Learned,
        ] {
            assert_eq!(PositionalEncoding::from_code(enc.code()), Some(enc));
        }
        assert_eq!(PositionalEncoding::from_code(7), None);
    }
}

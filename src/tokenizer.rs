//! Byte-level tokenizer with a small table of multi-byte substrings.
//!
//! Vocabulary layout:
//!
//! | ids        | meaning                                 |
//! |------------|-----------------------------------------|
//! | 0          | end of sequence                         |
//! | 1          | unknown byte                            |
//! | 2, 3       | `\n`, `\t`                              |
//! | 4..=98     | printable ASCII `0x20..=0x7e`           |
//! | 99..       | multi-byte substrings, longest match first |

use crate::error::LoadError;
use std::borrow::Cow;
use std::collections::HashMap;

/// Token identifier, always `< vocab_size`.
pub type Token = u32;

/// End-of-sequence token.
pub const EOS_TOKEN: Token = 0;
/// Fallback for unmappable bytes.
pub const UNK_TOKEN: Token = 1;
pub const NEWLINE_TOKEN: Token = 2;
pub const TAB_TOKEN: Token = 3;

/// Rendering of UNK and of ids outside the vocabulary.
pub const UNK_PLACEHOLDER: char = '\u{FFFD}';

const PRINTABLE_FIRST: u8 = 0x20;
const PRINTABLE_LAST: u8 = 0x7e;
const PRINTABLE_OFFSET: Token = 4;

/// First id of the substring table.
pub const SUBSTRING_OFFSET: Token =
    PRINTABLE_OFFSET + (PRINTABLE_LAST - PRINTABLE_FIRST) as Token + 1;

/// High-frequency English substrings shipped with the default vocabulary.
pub const DEFAULT_SUBSTRINGS: [&str; 29] = [
    " the", "the ", " and", "ing", "tion", " of", " to", " a ", " in", " is", "er", "th",
    "he", "in", "an", "re", "on", "en", "at", "ed", "es", "or", "nd", "ou", "it", ". ",
    ", ", "\n\n", "    ",
];

/// Size of the default vocabulary.
pub const VOCAB_SIZE: usize = SUBSTRING_OFFSET as usize + DEFAULT_SUBSTRINGS.len();

/// Two-tier greedy tokenizer. Immutable once built and safe to share.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    substrings: Vec<String>,
    /// Substring ids keyed by first byte, longest first.
    candidates: HashMap<u8, Vec<Token>>,
    max_context_length: usize,
}

impl Tokenizer {
    /// Tokenizer over the default vocabulary.
    pub fn new(max_context_length: usize) -> Self {
        let substrings = DEFAULT_SUBSTRINGS.iter().map(|s| s.to_string()).collect();
        Self::build(substrings, max_context_length)
    }

    /// Tokenizer over a custom substring table. Entries must be ASCII, at
    /// least two bytes long, and unique.
    pub fn with_substrings(
        substrings: Vec<String>,
        max_context_length: usize,
    ) -> std::result::Result<Self, LoadError> {
        let mut seen = std::collections::HashSet::new();
        for s in &substrings {
            if s.len() < 2 || !s.is_ascii() {
                return Err(LoadError::InvalidConfig(format!(
                    "substring {:?} must be ASCII and at least two bytes",
                    s
                )));
            }
            if !seen.insert(s.as_str()) {
                return Err(LoadError::InvalidConfig(format!("duplicate substring {:?}", s)));
            }
        }
        Ok(Self::build(substrings, max_context_length))
    }

    fn build(substrings: Vec<String>, max_context_length: usize) -> Self {
        let mut candidates: HashMap<u8, Vec<Token>> = HashMap::new();
        for (i, s) in substrings.iter().enumerate() {
            candidates
                .entry(s.as_bytes()[0])
                .or_default()
                .push(SUBSTRING_OFFSET + i as Token);
        }
        for ids in candidates.values_mut() {
            ids.sort_by_key(|&id| {
                std::cmp::Reverse(substrings[(id - SUBSTRING_OFFSET) as usize].len())
            });
        }
        Tokenizer {
            substrings,
            candidates,
            max_context_length,
        }
    }

    /// Number of token ids.
    pub fn vocab_size(&self) -> usize {
        SUBSTRING_OFFSET as usize + self.substrings.len()
    }

    pub fn max_context_length(&self) -> usize {
        self.max_context_length
    }

    /// Convert raw bytes to tokens, stopping at `max_context_length` tokens.
    pub fn encode(&self, text: &[u8]) -> Vec<Token> {
        self.encode_prefix(text).0
    }

    /// Like [`Tokenizer::encode`], also returning how many input bytes were
    /// consumed before the context limit stopped tokenization.
    pub fn encode_prefix(&self, text: &[u8]) -> (Vec<Token>, usize) {
        let mut tokens = Vec::with_capacity(text.len().min(self.max_context_length));
        let mut pos = 0;

        while pos < text.len() && tokens.len() < self.max_context_length {
            let rest = &text[pos..];
            if let Some((id, len)) = self.match_substring(rest) {
                tokens.push(id);
                pos += len;
                continue;
            }
            tokens.push(byte_token(rest[0]));
            pos += 1;
        }

        (tokens, pos)
    }

    /// Longest substring matching the start of `rest`.
    fn match_substring(&self, rest: &[u8]) -> Option<(Token, usize)> {
        let ids = self.candidates.get(&rest[0])?;
        ids.iter().find_map(|&id| {
            let s = self.substrings[(id - SUBSTRING_OFFSET) as usize].as_bytes();
            rest.starts_with(s).then_some((id, s.len()))
        })
    }

    /// Text for a single token. Unknown and out-of-range ids render as
    /// [`UNK_PLACEHOLDER`]; EOS renders as nothing.
    pub fn decode_token(&self, token: Token) -> Cow<'_, str> {
        match token {
            EOS_TOKEN => Cow::Borrowed(""),
            NEWLINE_TOKEN => Cow::Borrowed("\n"),
            TAB_TOKEN => Cow::Borrowed("\t"),
            t if (PRINTABLE_OFFSET..SUBSTRING_OFFSET).contains(&t) => {
                let byte = (t - PRINTABLE_OFFSET) as u8 + PRINTABLE_FIRST;
                Cow::Owned(char::from(byte).to_string())
            }
            t if t >= SUBSTRING_OFFSET => match self.substrings.get((t - SUBSTRING_OFFSET) as usize)
            {
                Some(s) => Cow::Borrowed(s.as_str()),
                None => Cow::Owned(UNK_PLACEHOLDER.to_string()),
            },
            _ => Cow::Owned(UNK_PLACEHOLDER.to_string()),
        }
    }

    /// Convert tokens back to text.
    pub fn decode(&self, tokens: &[Token]) -> String {
        let mut text = String::with_capacity(tokens.len());
        for &t in tokens {
            text.push_str(&self.decode_token(t));
        }
        text
    }
}

/// Single-byte fallback tier.
#[inline]
fn byte_token(b: u8) -> Token {
    match b {
        b'\n' => NEWLINE_TOKEN,
        b'\t' => TAB_TOKEN,
        PRINTABLE_FIRST..=PRINTABLE_LAST => (b - PRINTABLE_FIRST) as Token + PRINTABLE_OFFSET,
        _ => UNK_TOKEN,
    }
}

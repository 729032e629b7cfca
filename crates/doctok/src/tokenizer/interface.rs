use crate::Result;
use std::sync::Arc;

/// A single token and whether whitespace followed it in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub whitespace: bool,
}

impl Token {
    pub fn new(text: impl Into<String>, whitespace: bool) -> Self {
        Self {
            text: text.into(),
            whitespace,
        }
    }
}

/// The tokenized form of one attribute value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSequence {
    pub tokens: Vec<Token>,
}

impl TokenSequence {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Rebuilds the text, with single spaces where whitespace was.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            out.push_str(&token.text);
            if token.whitespace {
                out.push(' ');
            }
        }
        out
    }
}

/// A loaded tokenizer engine.
pub trait Tokenizer: Send + Sync {
    /// The configuration identifier this engine was loaded for.
    fn config_id(&self) -> &str;

    fn tokenize(&self, text: &str) -> TokenSequence;

    /// Splits an already tokenized text into sentences.
    fn sentence_split(&self, sequence: &TokenSequence) -> Vec<String>;

    /// Longest input, in characters, the engine accepts in one call.
    fn max_length(&self) -> usize {
        1_000_000
    }
}

/// Materializes a [`Tokenizer`] for a configuration identifier.
///
/// Loading may be slow (model download, file IO); callers run it on the
/// blocking pool.
pub trait TokenizerLoader: Send + Sync {
    fn load(&self, config_id: &str) -> Result<Arc<dyn Tokenizer>>;
}

//! Language-agnostic tokenizer built from whitespace and punctuation rules.
//!
//! Text is first split on whitespace. Opening punctuation is then peeled off
//! the front of every chunk and closing punctuation off the back, each into
//! its own token: `"(Hello, world!)"` becomes `( Hello , world ! )`.

use crate::{Result, Token, TokenSequence, Tokenizer, TokenizerLoader};
use std::sync::Arc;

const PREFIXES: &str = "\"'([{¿¡«“‘„";
const SUFFIXES: &str = "\"')]}.,;:!?»“”’…";

#[derive(Debug, Clone)]
pub struct RuleBasedTokenizer {
    config_id: String,
    max_length: usize,
}

impl RuleBasedTokenizer {
    pub fn new(config_id: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            max_length: 1_000_000,
        }
    }

    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }
}

impl Tokenizer for RuleBasedTokenizer {
    fn config_id(&self) -> &str {
        &self.config_id
    }

    fn tokenize(&self, text: &str) -> TokenSequence {
        let mut tokens = Vec::new();
        let mut rest = text;
        loop {
            let trimmed = rest.trim_start();
            if trimmed.is_empty() {
                break;
            }
            let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
            let (chunk, tail) = trimmed.split_at(end);
            rest = tail;
            split_affixes(chunk, !tail.is_empty(), &mut tokens);
        }
        TokenSequence { tokens }
    }

    fn sentence_split(&self, sequence: &TokenSequence) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut current = String::new();
        for token in &sequence.tokens {
            current.push_str(&token.text);
            if token.whitespace {
                current.push(' ');
            }
            if is_sentence_end(&token.text) {
                flush(&mut current, &mut sentences);
            }
        }
        flush(&mut current, &mut sentences);
        sentences
    }

    fn max_length(&self) -> usize {
        self.max_length
    }
}

/// Loads a [`RuleBasedTokenizer`] for any configuration identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedLoader {
    max_length: Option<usize>,
}

impl RuleBasedLoader {
    pub const fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: Some(max_length),
        }
    }
}

impl TokenizerLoader for RuleBasedLoader {
    fn load(&self, config_id: &str) -> Result<Arc<dyn Tokenizer>> {
        let mut tokenizer = RuleBasedTokenizer::new(config_id);
        if let Some(max_length) = self.max_length {
            tokenizer = tokenizer.with_max_length(max_length);
        }
        Ok(Arc::new(tokenizer))
    }
}

fn split_affixes(chunk: &str, trailing_whitespace: bool, out: &mut Vec<Token>) {
    let mut core = chunk;

    while let Some(c) = core.chars().next() {
        if core.len() == c.len_utf8() || !PREFIXES.contains(c) {
            break;
        }
        let (prefix, rest) = core.split_at(c.len_utf8());
        out.push(Token::new(prefix, false));
        core = rest;
    }

    let mut suffixes = Vec::new();
    while let Some(c) = core.chars().next_back() {
        if core.len() == c.len_utf8() || !SUFFIXES.contains(c) {
            break;
        }
        let (rest, suffix) = core.split_at(core.len() - c.len_utf8());
        suffixes.push(suffix);
        core = rest;
    }

    out.push(Token::new(core, false));
    out.extend(suffixes.into_iter().rev().map(|s| Token::new(s, false)));
    if let Some(last) = out.last_mut() {
        last.whitespace = trailing_whitespace;
    }
}

fn is_sentence_end(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| matches!(c, '.' | '!' | '?' | '…'))
}

fn flush(current: &mut String, sentences: &mut Vec<String>) {
    let sentence = current.trim_end();
    if !sentence.is_empty() {
        sentences.push(sentence.to_owned());
    }
    current.clear();
}

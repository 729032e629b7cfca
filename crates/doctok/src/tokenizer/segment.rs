//! Sentence segmentation of free text (e.g. converted markdown).
//!
//! The engine's own sentence boundaries are too eager on headings, list items
//! and abbreviations. Fragments are therefore merged until one ends in `.`,
//! `;`, `?` or `!`, and the resulting sentences are separated by blank lines.

use crate::Tokenizer;

const TERMINATORS: [char; 4] = ['.', ';', '?', '!'];

/// Rewrites `content` as one likely sentence per paragraph.
///
/// Input longer than [`Tokenizer::max_length`] is processed in chunks of that
/// many characters; the chunk outputs are joined with a blank line.
pub fn segment_sentences(tokenizer: &dyn Tokenizer, content: &str) -> String {
    let max_length = tokenizer.max_length().max(1);
    if content.chars().count() <= max_length {
        return segment_chunk(tokenizer, content);
    }
    chunk_text(content, max_length)
        .into_iter()
        .map(|chunk| segment_chunk(tokenizer, chunk))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn segment_chunk(tokenizer: &dyn Tokenizer, text: &str) -> String {
    let sequence = tokenizer.tokenize(text);
    merge_fragments(tokenizer.sentence_split(&sequence)).join("\n\n")
}

/// Joins sentence fragments with a space until a fragment ends in a
/// terminator. Blank fragments are skipped; a trailing unterminated fragment
/// is kept.
pub fn merge_fragments<I>(fragments: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut sentences = Vec::new();
    let mut current: Option<String> = None;
    for fragment in fragments {
        let Some(last_char) = fragment.trim().chars().next_back() else {
            continue;
        };
        match current.as_mut() {
            Some(sentence) => {
                sentence.push(' ');
                sentence.push_str(&fragment);
            }
            None => current = Some(fragment),
        }
        if TERMINATORS.contains(&last_char) {
            sentences.extend(current.take());
        }
    }
    sentences.extend(current);
    sentences
}

/// Splits `text` into pieces of at most `size` characters.
fn chunk_text(text: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == size {
            chunks.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuleBasedTokenizer;

    fn owned(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn fragments_merge_until_terminated() {
        let merged = merge_fragments(owned(&["# Title", "Intro text.", "  ", "a; b", "c;", "tail"]));
        assert_eq!(merged, ["# Title Intro text.", "a; b c;", "tail"]);
    }

    #[test]
    fn chunks_respect_char_boundaries() {
        assert_eq!(chunk_text("äbcdé", 2), ["äb", "cd", "é"]);
        assert_eq!(chunk_text("abcd", 2), ["ab", "cd"]);
        assert!(chunk_text("", 3).is_empty());
    }

    #[test]
    fn segments_are_separated_by_blank_lines() {
        let tokenizer = RuleBasedTokenizer::new("en_core_web_sm");
        let out = segment_sentences(&tokenizer, "Setup Install it. Run it! Done");
        assert_eq!(out, "Setup Install it.\n\nRun it!\n\nDone");
    }

    #[test]
    fn oversized_content_is_chunked() {
        let tokenizer = RuleBasedTokenizer::new("en_core_web_sm").with_max_length(10);
        let out = segment_sentences(&tokenizer, "Hi there. Yo.");
        // "Hi there. " | "Yo."
        assert_eq!(out, "Hi there.\n\nYo.");
    }
}

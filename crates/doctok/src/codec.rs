//! Binary encoding of tokenized record blobs.
//!
//! A blob holds one [`TokenSequence`] per covered attribute, in the order of
//! [`TokenizedRecord::columns`]. All integers are little-endian:
//!
//! ```text
//! u8  version (= 1)
//! u32 sequence count
//!   u32 token count
//!     u8  flags (bit 0: token is followed by whitespace)
//!     u32 byte length
//!     ..  UTF-8 token text
//! ```
//!
//! [`TokenizedRecord::columns`]: crate::TokenizedRecord::columns

use crate::{Error, Result, Token, TokenSequence};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const VERSION: u8 = 1;
const FLAG_WHITESPACE: u8 = 0b0000_0001;

/// Encodes the token sequences of one record.
pub fn encode_blob(sequences: &[TokenSequence]) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(sequences));
    buf.put_u8(VERSION);
    buf.put_u32_le(sequences.len() as u32);
    for sequence in sequences {
        buf.put_u32_le(sequence.tokens.len() as u32);
        for token in &sequence.tokens {
            buf.put_u8(if token.whitespace { FLAG_WHITESPACE } else { 0 });
            buf.put_u32_le(token.text.len() as u32);
            buf.put_slice(token.text.as_bytes());
        }
    }
    buf.freeze()
}

/// Decodes a blob produced by [`encode_blob`].
///
/// # Errors
///
/// Returns [`Error::Codec`] on an unknown version, truncated input, invalid
/// UTF-8 or trailing bytes.
pub fn decode_blob(mut buf: &[u8]) -> Result<Vec<TokenSequence>> {
    let version = read_u8(&mut buf)?;
    if version != VERSION {
        return Err(Error::codec(format!("unsupported blob version {version}")));
    }

    let count = read_u32(&mut buf)? as usize;
    // Never trust the header for the allocation size.
    let mut sequences = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        let token_count = read_u32(&mut buf)? as usize;
        let mut tokens = Vec::with_capacity(token_count.min(buf.remaining()));
        for _ in 0..token_count {
            let flags = read_u8(&mut buf)?;
            let len = read_u32(&mut buf)? as usize;
            if buf.remaining() < len {
                return Err(Error::codec("truncated token text"));
            }
            let text = core::str::from_utf8(&buf[..len])
                .map_err(|e| Error::codec(format!("invalid token text: {e}")))?
                .to_owned();
            buf.advance(len);
            tokens.push(Token {
                text,
                whitespace: flags & FLAG_WHITESPACE != 0,
            });
        }
        sequences.push(TokenSequence { tokens });
    }

    if buf.has_remaining() {
        return Err(Error::codec(format!(
            "{} trailing bytes after last sequence",
            buf.remaining()
        )));
    }
    Ok(sequences)
}

/// Appends one more sequence to an existing blob.
pub fn append_to_blob(blob: &[u8], sequence: TokenSequence) -> Result<Bytes> {
    let mut sequences = decode_blob(blob)?;
    sequences.push(sequence);
    Ok(encode_blob(&sequences))
}

fn encoded_len(sequences: &[TokenSequence]) -> usize {
    5 + sequences
        .iter()
        .map(|s| 4 + s.tokens.iter().map(|t| 5 + t.text.len()).sum::<usize>())
        .sum::<usize>()
}

fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::codec("unexpected end of blob"));
    }
    Ok(buf.get_u8())
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::codec("unexpected end of blob"));
    }
    Ok(buf.get_u32_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(words: &[(&str, bool)]) -> TokenSequence {
        TokenSequence {
            tokens: words
                .iter()
                .map(|(text, whitespace)| Token {
                    text: (*text).to_owned(),
                    whitespace: *whitespace,
                })
                .collect(),
        }
    }

    #[test]
    fn decode_restores_sequences_in_column_order() {
        let headline = sequence(&[("Grüße", true), ("aus", true), ("Köln", false), ("!", false)]);
        let empty = TokenSequence::default();
        let bytes = encode_blob(&[headline.clone(), empty.clone()]);

        assert_eq!(bytes.len(), encoded_len(&[headline.clone(), empty.clone()]));
        let decoded = decode_blob(&bytes).unwrap();
        assert_eq!(decoded, vec![headline, empty]);
        assert_eq!(decoded[0].len(), 4);
        assert!(decoded[1].is_empty());
    }

    #[test]
    fn append_keeps_existing_sequences() {
        let first = sequence(&[("a", true), ("b", false)]);
        let bytes = encode_blob(&[first.clone()]);
        let appended = append_to_blob(&bytes, sequence(&[("c", false)])).unwrap();

        let decoded = decode_blob(&appended).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], first);
        assert_eq!(decoded[1].tokens[0].text, "c");
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let bytes = encode_blob(&[sequence(&[("hello", true), ("world", false)])]);
        for cut in [0, 1, 4, bytes.len() - 1] {
            let err = decode_blob(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, Error::Codec { .. }), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn unknown_version_and_trailing_bytes_are_rejected() {
        let mut bytes = encode_blob(&[]).to_vec();
        assert!(decode_blob(&bytes).unwrap().is_empty());

        bytes.push(0);
        assert!(decode_blob(&bytes).is_err());

        bytes[0] = 9;
        assert!(decode_blob(&bytes).is_err());
    }
}

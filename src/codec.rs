//! Text-safe chunking for artifact transfer.
//!
//! Payloads are base64 encoded and the encoded text is cut into chunks of at
//! most `max_chunk_chars` characters, so every chunk can be embedded in a
//! JSON text frame as-is. The same codec is used for scripts and binaries on
//! both the dispatch and the receiving side.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

/// Default chunk size in encoded characters.
pub const DEFAULT_CHUNK_CHARS: usize = 4000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("chunk size must be at least one character")]
    ZeroChunkSize,
    #[error("artifact payload is not valid base64: {0}")]
    Decode(String),
}

/// Encode `payload` and split the encoded text into ordered chunks.
///
/// Produces `ceil(encoded_len / max_chunk_chars)` chunks; only the last one
/// may be shorter than `max_chunk_chars`. An empty payload yields no chunks.
pub fn split(payload: &[u8], max_chunk_chars: usize) -> Result<Vec<String>, CodecError> {
    if max_chunk_chars == 0 {
        return Err(CodecError::ZeroChunkSize);
    }

    let encoded = STANDARD.encode(payload);
    let mut chunks = Vec::with_capacity(chunk_count(payload.len(), max_chunk_chars));
    // base64 output is ASCII, byte offsets are char offsets.
    chunks.extend(
        encoded
            .as_bytes()
            .chunks(max_chunk_chars)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned()),
    );
    Ok(chunks)
}

/// Number of chunks `split` produces for a payload of `payload_len` bytes.
pub fn chunk_count(payload_len: usize, max_chunk_chars: usize) -> usize {
    if max_chunk_chars == 0 {
        return 0;
    }
    let encoded_len = payload_len.div_ceil(3) * 4;
    encoded_len.div_ceil(max_chunk_chars)
}

/// Concatenate chunks in the given order and decode the result.
///
/// Missing chunks are not detected here; callers hand over a complete,
/// ordered sequence.
pub fn join<I, S>(chunks: I) -> Result<Vec<u8>, CodecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut encoded = String::new();
    for chunk in chunks {
        encoded.push_str(chunk.as_ref());
    }
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(|error| CodecError::Decode(error.to_string()))
}

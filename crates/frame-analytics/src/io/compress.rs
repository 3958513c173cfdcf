//! gzip + base64 encoding of large JSON documents.
//!
//! Encoded text is split into chunks so each piece fits a line oriented
//! channel. Decoding concatenates the chunks, base64 decodes and inflates.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Upper bound on the characters of one chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("gzip failed: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decompressed data is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// gzip `bytes` and base64 encode the result.
pub fn compress_to_base64(bytes: &[u8]) -> Result<String, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

/// Reverse [`compress_to_base64`].
pub fn decompress_from_base64(encoded: &str) -> Result<String, CompressionError> {
    let compressed = STANDARD.decode(encoded.trim())?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}

/// Split base64 text into chunks of at most `chunk_size` characters.
///
/// A zero chunk size is treated as one.
pub fn chunk_encoded(encoded: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    if encoded.is_empty() {
        return vec![String::new()];
    }
    // base64 output is ASCII, so byte offsets are character offsets.
    encoded
        .as_bytes()
        .chunks(chunk_size)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

/// Concatenate chunks and decompress them.
pub fn decompress_chunks<S: AsRef<str>>(chunks: &[S]) -> Result<String, CompressionError> {
    let encoded: String = chunks.iter().map(AsRef::as_ref).collect();
    decompress_from_base64(&encoded)
}

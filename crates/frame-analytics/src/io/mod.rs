//! Output plumbing: line oriented JSON writer and compressed streams.

pub mod compress;
mod writer;

pub use compress::{
    CompressionError, DEFAULT_CHUNK_SIZE, chunk_encoded, compress_to_base64, decompress_chunks,
    decompress_from_base64,
};
pub use writer::{ConcurrentLineWriter, SharedBuffer};

//! Swappable body/node codec.
//!
//! The on-disk format treats compression as a pluggable capability with the
//! contract `encode(bytes) -> bytes`, `decode(bytes) -> Result<bytes, Err>`.
//! Index nodes are always run through the codec; document bodies go through
//! it only when their `content_meta` compressed bit is set.
//!
//! The default (and only built-in) codec is Snappy, matching the on-disk
//! format this crate is compatible with. `NoneCodec` exists for tests that
//! want to force many node splits without compression noise.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
}

/// Runtime codec discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Snappy,
}

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct SnappyCodec;
impl Codec for SnappyCodec {
    fn codec_id(&self) -> CodecId { CodecId::Snappy }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = snap::raw::Encoder::new();
        encoder.compress_vec(data).map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decoder = snap::raw::Decoder::new();
        decoder.decompress_vec(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None => Box::new(NoneCodec),
        CodecId::Snappy => Box::new(SnappyCodec),
    }
}

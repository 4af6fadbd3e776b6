//! The closed error-kind set surfaced by every engine operation.

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum GouchError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("chunk prefix shorter than 8 bytes")]
    ChunkShortPrefix,

    #[error("chunk size too small for a header")]
    ChunkSizeTooSmall,

    #[error("chunk payload truncated on disk")]
    ChunkDataTruncated,

    #[error("chunk CRC32 mismatch")]
    ChunkBadCrc,

    #[error("header payload size disagrees with its declared root sizes")]
    HeaderBadSize,

    #[error("btree node type byte is neither interior (0) nor leaf (1)")]
    InvalidBtreeNodeType,

    #[error("document not found")]
    DocumentNotFound,

    #[error("corrupt structure: {0}")]
    Corrupt(String),

    #[error("purge hook failed: {0}")]
    PurgeHook(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GouchError>;

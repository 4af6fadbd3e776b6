//! Chunk layer — length-prefixed, CRC32/IEEE-protected records on top of the
//! block layer, with optional codec wrapping for data chunks.

use std::io::{Read, Seek, Write};

use crc32fast::Hasher;

use crate::block::{self, BLOCK_SIZE};
use crate::codec::Codec;
use crate::error::{GouchError, Result};
use crate::raw;

const CHUNK_LENGTH_SIZE: u64 = 4;
const CHUNK_CRC_SIZE: u64 = 4;

fn crc32_ieee(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Reads a chunk at `pos`. `header` selects data-chunk (31-bit length, high
/// bit flag) vs header-chunk (full 32-bit length, includes the CRC size)
/// framing.
pub fn read_chunk_at<F: Read + Seek>(file: &mut F, pos: u64, header: bool) -> Result<Vec<u8>> {
    let mut prefix = vec![0u8; (CHUNK_LENGTH_SIZE + CHUNK_CRC_SIZE) as usize];
    let n = block::read_at(file, &mut prefix, pos)?;
    if n < CHUNK_LENGTH_SIZE + CHUNK_CRC_SIZE {
        return Err(GouchError::ChunkShortPrefix);
    }

    let mut size = raw::decode_raw31(&prefix[0..4]);
    let crc = raw::decode_raw32(&prefix[4..8]);

    if header && size < (CHUNK_LENGTH_SIZE as u32 + 1) {
        return Err(GouchError::ChunkSizeTooSmall);
    }
    if header {
        size -= CHUNK_LENGTH_SIZE as u32; // header chunks include the crc length, data chunks do not
    }

    let mut data = vec![0u8; size as usize];
    let data_pos = pos + n;
    let read = block::read_at(file, &mut data, data_pos)?;
    if (read as u32) < size {
        return Err(GouchError::ChunkDataTruncated);
    }

    if crc32_ieee(&data) != crc {
        return Err(GouchError::ChunkBadCrc);
    }

    Ok(data)
}

/// Reads a data chunk and runs it through the codec's decode.
pub fn read_compressed_data_chunk_at<F: Read + Seek>(
    file: &mut F,
    pos: u64,
    codec: &dyn Codec,
) -> Result<Vec<u8>> {
    let chunk = read_chunk_at(file, pos, false)?;
    Ok(codec.decode(&chunk)?)
}

/// Appends `buf` at `pos` (the engine's current tail), returns
/// `(chunk_start, bytes_consumed)`. For headers, the tail is first advanced
/// to the next 4096-byte boundary (the padding is implicit — nothing is
/// physically written for it, it is just a position bump); `chunk_start` is
/// that aligned address and `bytes_consumed` covers the padding plus the
/// chunk itself, so the caller can advance its own tail cursor by
/// `bytes_consumed` from the original (pre-padding) `pos`.
pub fn write_chunk_at<F: Write + Seek>(
    file: &mut F,
    pos: u64,
    buf: &[u8],
    header: bool,
) -> Result<(u64, u64)> {
    let original_pos = pos;
    let start_pos = if header { align_to_block_boundary(pos) } else { pos };
    let mut pos = start_pos;
    let mut end_pos = pos;

    let mut size = buf.len() as u32;
    if header {
        size += CHUNK_CRC_SIZE as u32; // header chunks include the length of the crc
    }
    let crc = crc32_ieee(buf);

    let size_bytes = if header {
        raw::encode_raw32(size)
    } else {
        raw::encode_raw31_highestbiton(size)
    };
    let crc_bytes = raw::encode_raw32(crc);

    let written = block::write_at(file, &size_bytes, pos, header)?;
    pos += written;
    end_pos += written;

    let written = block::write_at(file, &crc_bytes, pos, header)?;
    pos += written;
    end_pos += written;

    let written = block::write_at(file, buf, pos, header)?;
    end_pos += written;

    Ok((start_pos, end_pos - original_pos))
}

/// Advances `pos` up to the next 4096-byte boundary, if it isn't already on
/// one. Used before writing a header chunk.
pub fn align_to_block_boundary(pos: u64) -> u64 {
    if pos % BLOCK_SIZE != 0 {
        pos + (BLOCK_SIZE - (pos % BLOCK_SIZE))
    } else {
        pos
    }
}

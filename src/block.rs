//! Block layer — turns an arbitrary byte stream into a structure where every
//! 4096-byte boundary reserves one marker byte distinguishing data (`0x00`)
//! from header (`0x01`).
//!
//! Every other layer in the engine (chunks, nodes, headers) is built on top
//! of the positioned read/write primitives here; they never see the marker
//! bytes.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{GouchError, Result};

pub const BLOCK_SIZE: u64 = 4096;
pub const BLOCK_MARKER_SIZE: u64 = 1;

pub const BLOCK_DATA: u8 = 0x00;
pub const BLOCK_HEADER: u8 = 0x01;
const BLOCK_INVALID: u8 = 0xff;

/// Positioned read of `buf.len()` payload bytes at offset `pos`, skipping any
/// block marker bytes transparently. Returns the number of bytes actually
/// consumed from the underlying file (payload + skipped markers), which is
/// what the caller needs to advance its own cursor.
pub fn read_at<F: Read + Seek>(file: &mut F, buf: &mut [u8], pos: u64) -> Result<u64> {
    let mut read_so_far: u64 = 0;
    let mut skipped: u64 = 0;
    let mut remaining = buf.len() as u64;
    let mut offset = pos;

    while remaining > 0 {
        let mut till_next_block = BLOCK_SIZE - (offset % BLOCK_SIZE);
        if till_next_block == BLOCK_SIZE {
            offset += 1;
            till_next_block -= 1;
            skipped += 1;
        }
        let this_pass = till_next_block.min(remaining);

        file.seek(SeekFrom::Start(offset))?;
        let dst = &mut buf[read_so_far as usize..(read_so_far + this_pass) as usize];
        let n = read_fully_or_short(file, dst)?;

        offset += n;
        read_so_far += n;
        remaining -= n;

        if n < this_pass {
            return Ok(read_so_far + skipped);
        }
    }
    Ok(read_so_far + skipped)
}

/// Reads as many bytes as are available into `buf`, short of EOF. Mirrors
/// the underlying `ReadAt` semantics the original engine relies on, where a
/// short read is not itself an error — the caller interprets the shortfall.
fn read_fully_or_short<F: Read>(file: &mut F, buf: &mut [u8]) -> Result<u64> {
    let mut total = 0usize;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(GouchError::Io(e)),
        }
    }
    Ok(total as u64)
}

/// Positioned write of `buf` at offset `pos`, inserting a block marker byte
/// (`header` selects which marker) at every 4096-boundary crossed. Returns
/// the number of bytes consumed in the underlying file.
pub fn write_at<F: Write + Seek>(file: &mut F, buf: &[u8], pos: u64, header: bool) -> Result<u64> {
    let marker = if header { BLOCK_HEADER } else { BLOCK_DATA };
    let buf_size = buf.len() as u64;
    let mut write_pos = pos;
    let mut buf_pos: u64 = 0;

    while buf_pos < buf_size {
        let mut block_remain = BLOCK_SIZE - (write_pos % BLOCK_SIZE);
        if block_remain > buf_size - buf_pos {
            block_remain = buf_size - buf_pos;
        }

        if write_pos % BLOCK_SIZE == 0 {
            file.seek(SeekFrom::Start(write_pos))?;
            file.write_all(&[marker])?;
            write_pos += 1;
            continue;
        }

        file.seek(SeekFrom::Start(write_pos))?;
        let slice = &buf[buf_pos as usize..(buf_pos + block_remain) as usize];
        file.write_all(slice)?;
        buf_pos += block_remain;
        write_pos += block_remain;
    }

    Ok(write_pos - pos)
}

/// Scans backwards in 4096-byte steps from `pos`, reading the single marker
/// byte at each boundary, until it finds a data or header marker.
pub fn seek_previous_block_from<F: Read + Seek>(file: &mut F, pos: u64) -> Result<Option<(u64, u8)>> {
    if pos == 0 {
        return Ok(None);
    }
    let mut pos = pos - 1;
    pos -= pos % BLOCK_SIZE;

    let mut marker = [0u8; 1];
    file.seek(SeekFrom::Start(pos))?;
    let n = read_fully_or_short(file, &mut marker)?;
    if n != 1 {
        return Ok(None);
    }
    match marker[0] {
        BLOCK_HEADER => Ok(Some((pos, BLOCK_HEADER))),
        BLOCK_DATA => Ok(Some((pos, BLOCK_DATA))),
        _ => Ok(None), // malformed marker terminates the backward scan
    }
}

/// Repeatedly seeks to the previous block boundary until a header-marked
/// block is found.
pub fn seek_last_header_block_from<F: Read + Seek>(file: &mut F, pos: u64) -> Result<Option<u64>> {
    let mut cur = pos;
    loop {
        match seek_previous_block_from(file, cur)? {
            Some((found_pos, BLOCK_HEADER)) => return Ok(Some(found_pos)),
            Some((found_pos, marker)) if marker == BLOCK_DATA => {
                cur = found_pos;
            }
            _ => return Ok(None),
        }
    }
}

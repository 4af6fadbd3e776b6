//! Database header: disk version, update/purge bookkeeping, and the three
//! tree roots. Headers are self-describing chunks (see [`crate::chunk`])
//! written with the dummy-then-real two-phase protocol in
//! [`crate::engine`].

use std::io::{Read, Seek};

use crate::block;
use crate::chunk;
use crate::error::{GouchError, Result};
use crate::node::NodePointer;
use crate::raw::{decode_raw08, decode_raw16, decode_raw48, encode_raw08, encode_raw16, encode_raw48};

pub const HEADER_BASE_SIZE: usize = 25;
pub const DISK_VERSION: u8 = 11;

#[derive(Debug, Clone)]
pub struct Header {
    pub disk_version: u8,
    pub update_seq: u64,
    pub purge_seq: u64,
    pub purge_ptr: u64,
    pub by_seq_root: Option<NodePointer>,
    pub by_id_root: Option<NodePointer>,
    pub local_docs_root: Option<NodePointer>,
    /// File offset this header was read from (or will be written at).
    pub position: u64,
}

impl Header {
    pub fn empty() -> Self {
        Header {
            disk_version: DISK_VERSION,
            update_seq: 0,
            purge_seq: 0,
            purge_ptr: 0,
            by_seq_root: None,
            by_id_root: None,
            local_docs_root: None,
            position: 0,
        }
    }

    fn root_size(root: &Option<NodePointer>) -> usize {
        match root {
            Some(p) => node_root_encoded_len(p),
            None => 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let seq_size = Self::root_size(&self.by_seq_root);
        let id_size = Self::root_size(&self.by_id_root);
        let local_size = Self::root_size(&self.local_docs_root);

        let mut buf = Vec::with_capacity(HEADER_BASE_SIZE + seq_size + id_size + local_size);
        buf.extend_from_slice(&encode_raw08(self.disk_version));
        buf.extend_from_slice(&encode_raw48(self.update_seq));
        buf.extend_from_slice(&encode_raw48(self.purge_seq));
        buf.extend_from_slice(&encode_raw48(self.purge_ptr));
        buf.extend_from_slice(&encode_raw16(seq_size as u16));
        buf.extend_from_slice(&encode_raw16(id_size as u16));
        buf.extend_from_slice(&encode_raw16(local_size as u16));

        if let Some(p) = &self.by_seq_root {
            buf.extend_from_slice(&p.encode_root());
        }
        if let Some(p) = &self.by_id_root {
            buf.extend_from_slice(&p.encode_root());
        }
        if let Some(p) = &self.local_docs_root {
            buf.extend_from_slice(&p.encode_root());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_BASE_SIZE {
            return Err(GouchError::HeaderBadSize);
        }
        let disk_version = decode_raw08(&data[0..1]);
        let update_seq = decode_raw48(&data[1..7]);
        let purge_seq = decode_raw48(&data[7..13]);
        let purge_ptr = decode_raw48(&data[13..19]);
        let seq_size = decode_raw16(&data[19..21]) as usize;
        let id_size = decode_raw16(&data[21..23]) as usize;
        let local_size = decode_raw16(&data[23..25]) as usize;

        if data.len() != HEADER_BASE_SIZE + seq_size + id_size + local_size {
            return Err(GouchError::HeaderBadSize);
        }

        let mut offset = HEADER_BASE_SIZE;
        let by_seq_root = if seq_size > 0 {
            let root = Some(NodePointer::decode_root(&data[offset..offset + seq_size]));
            offset += seq_size;
            root
        } else {
            None
        };
        let by_id_root = if id_size > 0 {
            let root = Some(NodePointer::decode_root(&data[offset..offset + id_size]));
            offset += id_size;
            root
        } else {
            None
        };
        let local_docs_root = if local_size > 0 {
            Some(NodePointer::decode_root(&data[offset..offset + local_size]))
        } else {
            None
        };

        Ok(Header {
            disk_version,
            update_seq,
            purge_seq,
            purge_ptr,
            by_seq_root,
            by_id_root,
            local_docs_root,
            position: 0,
        })
    }
}

fn node_root_encoded_len(p: &NodePointer) -> usize {
    crate::node::ROOT_BASE_SIZE + p.reduced_value.len()
}

/// Reads and decodes the header chunk at `pos`.
pub fn read_header_at<F: Read + Seek>(file: &mut F, pos: u64) -> Result<Header> {
    let chunk_data = chunk::read_chunk_at(file, pos, true)?;
    let mut header = Header::decode(&chunk_data)?;
    header.position = pos;
    Ok(header)
}

/// Opening-time recovery: starting from `from_pos` (typically EOF), scans
/// backward block by block for the most recent header whose chunk framing
/// and CRC check out. A header chunk can exist on disk but fail to
/// validate if the writer crashed mid-write; in that case the scan keeps
/// walking further back rather than giving up at the first candidate.
pub fn find_last_header<F: Read + Seek>(file: &mut F, from_pos: u64) -> Result<Header> {
    let mut scan_from = from_pos;
    loop {
        let header_pos = match block::seek_last_header_block_from(file, scan_from)? {
            Some(pos) => pos,
            None => return Err(GouchError::Corrupt("no valid header found during recovery scan".into())),
        };
        match read_header_at(file, header_pos) {
            Ok(header) => return Ok(header),
            Err(_) if header_pos > 0 => {
                scan_from = header_pos;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;
    use std::io::Cursor;

    fn file_with_len(len: usize) -> Cursor<Vec<u8>> {
        Cursor::new(vec![0u8; len])
    }

    #[test]
    fn empty_header_roundtrip() {
        let h = Header::empty();
        let decoded = Header::decode(&h.encode()).unwrap();
        assert_eq!(decoded.disk_version, DISK_VERSION);
        assert_eq!(decoded.update_seq, 0);
        assert!(decoded.by_id_root.is_none());
    }

    #[test]
    fn header_with_roots_roundtrip() {
        let mut h = Header::empty();
        h.update_seq = 42;
        h.by_id_root = Some(NodePointer {
            key: Vec::new(),
            pointer: 4096,
            reduced_value: vec![1; 16],
            subtree_size: 200,
        });
        let decoded = Header::decode(&h.encode()).unwrap();
        assert_eq!(decoded.update_seq, 42);
        let root = decoded.by_id_root.unwrap();
        assert_eq!(root.pointer, 4096);
        assert_eq!(root.subtree_size, 200);
        assert_eq!(root.reduced_value, vec![1; 16]);
    }

    #[test]
    fn read_header_at_roundtrips_through_chunk_layer() {
        let mut f = file_with_len(BLOCK_SIZE as usize * 2);
        let h = Header::empty();
        let (pos, _) = chunk::write_chunk_at(&mut f, 0, &h.encode(), true).unwrap();
        let read_back = read_header_at(&mut f, pos).unwrap();
        assert_eq!(read_back.disk_version, DISK_VERSION);
    }

    #[test]
    fn find_last_header_recovers_most_recent() {
        let mut f = file_with_len(BLOCK_SIZE as usize * 8);
        let mut h1 = Header::empty();
        h1.update_seq = 1;
        let (_, consumed1) = chunk::write_chunk_at(&mut f, 0, &h1.encode(), true).unwrap();

        let mut h2 = Header::empty();
        h2.update_seq = 2;
        let tail = consumed1;
        let (_, _) = chunk::write_chunk_at(&mut f, tail, &h2.encode(), true).unwrap();

        let eof = f.get_ref().len() as u64;
        let found = find_last_header(&mut f, eof).unwrap();
        assert_eq!(found.update_seq, 2);
    }
}

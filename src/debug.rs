//! Raw-offset inspection: given any file position, work out whether it
//! addresses a header, a b+tree node, or a plain data chunk, and print it.
//!
//! Every couchstore-family store ships a debug tool shaped like this — point
//! it at a byte offset pulled from a `NodePointer` or a header dump and it
//! tells you what lives there. The one divergence from the original: rather
//! than inferring a block boundary's marker through the block-transparent
//! reader (which actually reads the payload byte *after* the marker, not the
//! marker itself), this reads the marker byte directly. See `DESIGN.md`.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::block::{BLOCK_DATA, BLOCK_HEADER, BLOCK_SIZE};
use crate::chunk;
use crate::codec::Codec;
use crate::error::Result;
use crate::header::{self, Header};
use crate::node::{self, ByIdValue, BySeqValue, LocalDocValue, NodePointer, BTREE_INTERIOR, BTREE_LEAF};

/// How to decode the values of a leaf node found at the target offset.
/// `Guess` picks `ById` if the node's first key is all printable
/// characters, `BySeq` otherwise (a raw 48-bit sequence number rarely is),
/// since local-docs and by-id keys are both variable-length document ids
/// and can't be told apart without tree context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTypeHint {
    ById,
    BySeq,
    LocalDocs,
    Guess,
}

const PREVIEW_LIMIT: usize = 256;

/// Prints whatever is found at `offset` to `out`. `print_raw` additionally
/// dumps the chunk's undecoded bytes as hex; `allow_large` lifts the
/// preview cap on document bodies and reduced values.
pub fn debug_address<F: Read + Seek, W: Write>(
    file: &mut F,
    codec: &dyn Codec,
    out: &mut W,
    offset: u64,
    print_raw: bool,
    allow_large: bool,
    index_hint: IndexTypeHint,
) -> Result<()> {
    if offset % BLOCK_SIZE == 0 {
        let marker = read_marker_byte(file, offset)?;
        if marker == BLOCK_HEADER {
            let header = header::read_header_at(file, offset)?;
            print_header(out, &header)?;
            return Ok(());
        }
        if marker != BLOCK_DATA {
            writeln!(out, "offset {offset}: unrecognized block marker 0x{marker:02x}")?;
            return Ok(());
        }
    }

    let raw = chunk::read_chunk_at(file, offset, false)?;
    if print_raw {
        print_hex(out, "raw chunk", &raw, allow_large)?;
    }

    match raw.first() {
        Some(&BTREE_INTERIOR) => print_node(out, &raw, false, index_hint, allow_large)?,
        Some(&BTREE_LEAF) => print_node(out, &raw, true, index_hint, allow_large)?,
        _ => {
            let body = codec.decode(&raw).unwrap_or(raw);
            writeln!(out, "offset {offset}: data chunk, {} bytes (decoded)", body.len())?;
            print_hex(out, "body", &body, allow_large)?;
        }
    }
    Ok(())
}

fn read_marker_byte<F: Read + Seek>(file: &mut F, pos: u64) -> Result<u8> {
    file.seek(SeekFrom::Start(pos))?;
    let mut marker = [0u8; 1];
    file.read_exact(&mut marker)?;
    Ok(marker[0])
}

fn print_header<W: Write>(out: &mut W, header: &Header) -> Result<()> {
    writeln!(out, "header @ {}", header.position)?;
    writeln!(out, "  disk_version: {}", header.disk_version)?;
    writeln!(out, "  update_seq:   {}", header.update_seq)?;
    writeln!(out, "  purge_seq:    {}", header.purge_seq)?;
    writeln!(out, "  purge_ptr:    {}", header.purge_ptr)?;
    print_root(out, "by_seq_root", &header.by_seq_root)?;
    print_root(out, "by_id_root", &header.by_id_root)?;
    print_root(out, "local_docs_root", &header.local_docs_root)?;
    Ok(())
}

fn print_root<W: Write>(out: &mut W, label: &str, root: &Option<NodePointer>) -> Result<()> {
    match root {
        Some(p) => writeln!(
            out,
            "  {label}: pointer=0x{:x} subtree_size={} reduced_value={} bytes",
            p.pointer,
            p.subtree_size,
            p.reduced_value.len()
        )?,
        None => writeln!(out, "  {label}: (empty)")?,
    }
    Ok(())
}

fn print_node<W: Write>(out: &mut W, raw: &[u8], is_leaf: bool, index_hint: IndexTypeHint, allow_large: bool) -> Result<()> {
    writeln!(out, "{} node, {} bytes", if is_leaf { "leaf" } else { "interior" }, raw.len())?;

    // Resolve `Guess` once, from the node's first key, the same way the Go
    // original's DebugAddress does — a key made up entirely of printable
    // characters is likely a by-id identifier, anything else is likely a
    // sequence number's raw bytes.
    let resolved_hint = if index_hint == IndexTypeHint::Guess {
        match node::KeyValueIterator::new(&raw[1..]).next() {
            Some((first_key, _)) if is_all_printable(first_key) => IndexTypeHint::ById,
            Some(_) => IndexTypeHint::BySeq,
            None => IndexTypeHint::ById,
        }
    } else {
        index_hint
    };

    for (key, value) in node::KeyValueIterator::new(&raw[1..]) {
        if is_leaf {
            print_leaf_entry(out, key, value, resolved_hint, allow_large)?;
        } else {
            let child = NodePointer::decode(value);
            writeln!(
                out,
                "  key={} -> pointer=0x{:x} subtree_size={} reduced_value={} bytes",
                preview_text(key),
                child.pointer,
                child.subtree_size,
                child.reduced_value.len(),
            )?;
        }
    }
    Ok(())
}

fn print_leaf_entry<W: Write>(out: &mut W, key: &[u8], value: &[u8], hint: IndexTypeHint, allow_large: bool) -> Result<()> {
    match hint {
        IndexTypeHint::ById => {
            let v = ByIdValue::decode(value);
            writeln!(
                out,
                "  id={} seq={} rev={} size={} deleted={} body_offset=0x{:x}",
                preview_text(key),
                v.seq,
                v.rev,
                v.size,
                v.deleted,
                v.body_offset,
            )?;
        }
        IndexTypeHint::BySeq => {
            let v = BySeqValue::decode(value);
            writeln!(
                out,
                "  seq={} id={} rev={} size={} deleted={} body_offset=0x{:x}",
                crate::raw::decode_raw48(key),
                preview_text(&v.id),
                v.rev,
                v.size,
                v.deleted,
                v.body_offset,
            )?;
        }
        IndexTypeHint::LocalDocs => {
            let v = LocalDocValue::decode(value);
            writeln!(out, "  id={} deleted={} body={} bytes", preview_text(key), v.deleted, v.body.len())?;
            print_hex(out, "  body", &v.body, allow_large)?;
        }
        IndexTypeHint::Guess => unreachable!("resolved before dispatch"),
    }
    Ok(())
}

/// Mirrors the Go original's `matchLikelyKey` regex (`^[[:print:]]*$`):
/// every byte must be an ASCII printable character (0x20..=0x7e). An empty
/// key matches trivially, same as the empty-string regex case.
fn is_all_printable(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| (0x20..=0x7e).contains(&b))
}

fn preview_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => format!("0x{}", hex_string(bytes)),
    }
}

fn print_hex<W: Write>(out: &mut W, label: &str, bytes: &[u8], allow_large: bool) -> Result<()> {
    if !allow_large && bytes.len() > PREVIEW_LIMIT {
        writeln!(out, "{label}: {} bytes, showing first {PREVIEW_LIMIT}", bytes.len())?;
        writeln!(out, "  {}", hex_string(&bytes[..PREVIEW_LIMIT]))?;
    } else {
        writeln!(out, "{label}: {} bytes", bytes.len())?;
        writeln!(out, "  {}", hex_string(bytes))?;
    }
    Ok(())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{get_codec, CodecId};
    use crate::compare::id_comparator;
    use crate::reduce::{by_id_re_reduce, by_id_reduce};
    use crate::tree::modify::{Action, ModifySpec, Modifier};
    use std::io::Cursor;

    #[test]
    fn debug_address_prints_header() {
        let mut file = Cursor::new(Vec::new());
        let h = Header::empty();
        let (pos, _) = chunk::write_chunk_at(&mut file, 0, &h.encode(), true).unwrap();
        let codec = get_codec(CodecId::None);
        let mut out = Vec::new();
        debug_address(&mut file, codec.as_ref(), &mut out, pos, false, false, IndexTypeHint::Guess).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("disk_version"));
    }

    #[test]
    fn debug_address_prints_leaf_node_with_guessed_hint() {
        let mut file = Cursor::new(Vec::new());
        let codec = get_codec(CodecId::None);
        let spec = ModifySpec {
            cmp: id_comparator,
            reduce: by_id_reduce,
            rereduce: by_id_re_reduce,
            kv_chunk_threshold: 1279,
            kp_chunk_threshold: 1279,
            compacting: false,
            purge: None,
        };
        let modifier = Modifier::new(&mut file, codec.as_ref(), spec);
        let mut tail = 0u64;
        let value = ByIdValue { seq: 1, size: 3, deleted: false, body_offset: 0, rev: 1, content_meta: 0, rev_meta: vec![] }.encode();
        let (root, _) = modifier
            .modify_btree(None, vec![Action::Insert(b"doc1".to_vec(), value)], &mut tail)
            .unwrap();
        let root = root.unwrap();

        let mut out = Vec::new();
        debug_address(&mut file, codec.as_ref(), &mut out, root.pointer, false, false, IndexTypeHint::Guess).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("leaf node"));
        assert!(text.contains("id=doc1"));
    }
}

//! Reduce / re-reduce functions for the three index trees.
//!
//! A reduce runs over raw leaf values; a re-reduce runs over the already
//! reduced values carried on a lower level of interior nodes. Both must
//! produce the identical on-disk encoding so a tree can be rebuilt
//! incrementally without recomputing from the leaves each time.

use crate::node::ByIdValue;
use crate::raw::{decode_raw40, decode_raw48, encode_raw40, encode_raw48};

/// `[not_deleted: u40][deleted: u40][size: u48]`
pub fn by_id_reduce(leaf_values: &[&[u8]]) -> Vec<u8> {
    let mut not_deleted: u64 = 0;
    let mut deleted: u64 = 0;
    let mut size: u64 = 0;
    for raw in leaf_values {
        let v = ByIdValue::decode(raw);
        if v.deleted {
            deleted += 1;
        } else {
            not_deleted += 1;
        }
        size += v.size as u64;
    }
    encode_by_id_reduce(not_deleted, deleted, size)
}

pub fn by_id_re_reduce(child_reduced_values: &[&[u8]]) -> Vec<u8> {
    let mut not_deleted: u64 = 0;
    let mut deleted: u64 = 0;
    let mut size: u64 = 0;
    for raw in child_reduced_values {
        let (nd, d, s) = decode_by_id_reduce(raw);
        not_deleted += nd;
        deleted += d;
        size += s;
    }
    encode_by_id_reduce(not_deleted, deleted, size)
}

pub fn encode_by_id_reduce(not_deleted: u64, deleted: u64, size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&encode_raw40(not_deleted));
    buf.extend_from_slice(&encode_raw40(deleted));
    buf.extend_from_slice(&encode_raw48(size));
    buf
}

pub fn decode_by_id_reduce(buf: &[u8]) -> (u64, u64, u64) {
    let not_deleted = decode_raw40(&buf[0..5]);
    let deleted = decode_raw40(&buf[5..10]);
    let size = decode_raw48(&buf[10..16]);
    (not_deleted, deleted, size)
}

/// `[count: u40]`
pub fn by_seq_reduce(leaf_values: &[&[u8]]) -> Vec<u8> {
    encode_raw40(leaf_values.len() as u64).to_vec()
}

pub fn by_seq_re_reduce(child_reduced_values: &[&[u8]]) -> Vec<u8> {
    let total: u64 = child_reduced_values.iter().map(|v| decode_raw40(v)).sum();
    encode_raw40(total).to_vec()
}

/// Local-docs tree: a trivial count reducer, same encoding as by-seq.
/// The Go reference never builds a reducer for this tree at all (its
/// compactor stubs the whole subtree out); this one is a supplement so the
/// tree can be incrementally maintained like the other two.
pub fn local_docs_reduce(leaf_values: &[&[u8]]) -> Vec<u8> {
    encode_raw40(leaf_values.len() as u64).to_vec()
}

pub fn local_docs_re_reduce(child_reduced_values: &[&[u8]]) -> Vec<u8> {
    by_seq_re_reduce(child_reduced_values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ByIdValue;

    fn sample(deleted: bool, size: u32) -> Vec<u8> {
        ByIdValue {
            seq: 1,
            size,
            deleted,
            body_offset: 10,
            rev: 1,
            content_meta: 0,
            rev_meta: vec![],
        }
        .encode()
    }

    #[test]
    fn by_id_reduce_counts_live_and_deleted() {
        let a = sample(false, 10);
        let b = sample(true, 20);
        let c = sample(false, 30);
        let reduced = by_id_reduce(&[&a, &b, &c]);
        let (nd, d, s) = decode_by_id_reduce(&reduced);
        assert_eq!((nd, d, s), (2, 1, 60));
    }

    #[test]
    fn by_id_re_reduce_sums_children() {
        let r1 = encode_by_id_reduce(2, 1, 60);
        let r2 = encode_by_id_reduce(3, 0, 15);
        let combined = by_id_re_reduce(&[&r1, &r2]);
        assert_eq!(decode_by_id_reduce(&combined), (5, 1, 75));
    }

    #[test]
    fn by_seq_reduce_counts_leaves() {
        let values: Vec<Vec<u8>> = vec![vec![0u8]; 4];
        let refs: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
        let reduced = by_seq_reduce(&refs);
        assert_eq!(decode_raw40(&reduced), 4);
    }

    #[test]
    fn by_seq_re_reduce_sums_children() {
        let r1 = encode_raw40(4).to_vec();
        let r2 = encode_raw40(6).to_vec();
        let combined = by_seq_re_reduce(&[&r1, &r2]);
        assert_eq!(decode_raw40(&combined), 10);
    }
}

//! Key comparators for the three index trees, plus small sort-order
//! wrappers used by the tree modifier and the sorted-tree builder.

use std::cmp::Ordering;

use crate::raw::decode_raw48;

/// Id and local-docs trees: plain byte-lexicographic order.
pub fn id_comparator(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// By-seq tree: numeric order over the 48-bit big-endian key.
pub fn seq_comparator(a: &[u8], b: &[u8]) -> Ordering {
    decode_raw48(a).cmp(&decode_raw48(b))
}

/// Sorts `(id, value)` pairs by id, keeping the pairing intact — used when
/// building a by-id tree from bulk-loaded documents.
pub fn sort_ids_and_values(pairs: &mut [(Vec<u8>, Vec<u8>)]) {
    pairs.sort_by(|a, b| id_comparator(&a.0, &b.0));
}

/// Sorts raw 48-bit sequence keys.
pub fn sort_seqs(seqs: &mut [u64]) {
    seqs.sort_unstable();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_comparator_is_lexicographic() {
        assert_eq!(id_comparator(b"a", b"b"), Ordering::Less);
        assert_eq!(id_comparator(b"ab", b"a"), Ordering::Greater);
        assert_eq!(id_comparator(b"x", b"x"), Ordering::Equal);
    }

    #[test]
    fn seq_comparator_is_numeric_not_lexicographic() {
        use crate::raw::encode_raw48;
        let small = encode_raw48(2);
        let big = encode_raw48(300);
        // lexicographically "300" as bytes would sort differently than
        // numeric order if this ever regressed to a byte compare.
        assert_eq!(seq_comparator(&small, &big), Ordering::Less);
    }
}

//! Read-side tree traversal: point/multi-point lookups and a lazy
//! range-walking iterator.
//!
//! The original engine expresses both with one recursive, callback-driven
//! descent shared between "fold" (range) and point-lookup modes. Here the
//! two are split: point lookup stays a direct recursive walk (it needs to
//! interleave multiple sorted keys against one pass over the tree, exactly
//! like the source), while the range walk is rebuilt as an explicit-stack
//! iterator so callers can stop early without the engine needing a
//! callback-with-backpointer to cooperatively unwind.

use std::cmp::Ordering;
use std::io::{Read, Seek};

use crate::chunk;
use crate::codec::Codec;
use crate::error::{GouchError, Result};
use crate::node::{self, NodePointer, BTREE_INTERIOR, BTREE_LEAF};

pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// Looks up each of `keys` (assumed already sorted by `cmp`) against the
/// tree rooted at `root`, in one pass. Returns `(key, value)` for hits and
/// leaves absent keys out.
pub fn lookup_multi<F: Read + Seek>(
    file: &mut F,
    codec: &dyn Codec,
    root: Option<&NodePointer>,
    keys: &[Vec<u8>],
    cmp: Comparator,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    if let Some(root) = root {
        if !keys.is_empty() {
            lookup_inner(file, codec, root, keys, 0, keys.len(), cmp, &mut out)?;
        }
    }
    Ok(out)
}

fn lookup_inner<F: Read + Seek>(
    file: &mut F,
    codec: &dyn Codec,
    np: &NodePointer,
    keys: &[Vec<u8>],
    mut current: usize,
    end: usize,
    cmp: Comparator,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    let nodebuf = chunk::read_compressed_data_chunk_at(file, np.pointer, codec)?;

    if nodebuf[0] != BTREE_LEAF && nodebuf[0] != BTREE_INTERIOR {
        return Err(GouchError::InvalidBtreeNodeType);
    }

    if nodebuf[0] == BTREE_LEAF {
        let mut pos = 1usize;
        while pos < nodebuf.len() && current < end {
            let (k, v, next_pos) = node::decode_key_value(&nodebuf, pos);
            pos = next_pos;
            if cmp(k, &keys[current]) == Ordering::Equal {
                out.push((k.to_vec(), v.to_vec()));
                current += 1;
            }
        }
    } else {
        let mut pos = 1usize;
        while pos < nodebuf.len() && current < end {
            let (k, v, next_pos) = node::decode_key_value(&nodebuf, pos);
            pos = next_pos;
            if cmp(k, &keys[current]) >= Ordering::Equal {
                let mut last_item = current + 1;
                while last_item < end && cmp(k, &keys[last_item]) != Ordering::Less {
                    last_item += 1;
                }
                let mut child = NodePointer::decode(v);
                child.key = k.to_vec();
                lookup_inner(file, codec, &child, keys, current, last_item, cmp, out)?;
                current = last_item;
            }
        }
    }
    Ok(())
}

/// A single stack frame in the iterative walk: the decoded node body and
/// the byte offset of the next unread `(key, value)` record.
struct Frame {
    body: Vec<u8>,
    pos: usize,
}

/// Lazily walks every `(key, value)` pair in id/seq/key order, optionally
/// bounded to keys `>= start_key`. Descends into interior nodes on demand
/// so a caller can stop consuming the iterator (e.g. after N results)
/// without having paid for the rest of the tree.
pub struct TreeWalker<'a, F> {
    file: &'a mut F,
    codec: &'a dyn Codec,
    stack: Vec<Frame>,
    start_key: Option<Vec<u8>>,
    end_key: Option<Vec<u8>>,
    cmp: Comparator,
    done: bool,
}

impl<'a, F: Read + Seek> TreeWalker<'a, F> {
    pub fn new(
        file: &'a mut F,
        codec: &'a dyn Codec,
        root: Option<&NodePointer>,
        start_key: Option<Vec<u8>>,
        cmp: Comparator,
    ) -> Result<Self> {
        Self::new_bounded(file, codec, root, start_key, None, cmp)
    }

    /// Like [`Self::new`], but also stops once a leaf key exceeds
    /// `end_key` (inclusive bound). Interior separator keys are not
    /// pruned against `end_key` — the walk may descend into a subtree
    /// entirely past the end and simply emit nothing from it before
    /// terminating at the first over-the-bound leaf key.
    pub fn new_bounded(
        file: &'a mut F,
        codec: &'a dyn Codec,
        root: Option<&NodePointer>,
        start_key: Option<Vec<u8>>,
        end_key: Option<Vec<u8>>,
        cmp: Comparator,
    ) -> Result<Self> {
        let mut stack = Vec::new();
        if let Some(root) = root {
            let body = chunk::read_compressed_data_chunk_at(file, root.pointer, codec)?;
            stack.push(Frame { body, pos: 1 });
        }
        Ok(TreeWalker { file, codec, stack, start_key, end_key, cmp, done: false })
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            if frame.pos >= frame.body.len() {
                self.stack.pop();
                continue;
            }
            if frame.body[0] != BTREE_LEAF && frame.body[0] != BTREE_INTERIOR {
                return Err(GouchError::InvalidBtreeNodeType);
            }
            let is_leaf = frame.body[0] == BTREE_LEAF;
            let (key, value, next_pos) = node::decode_key_value(&frame.body, frame.pos);
            let key = key.to_vec();
            let value = value.to_vec();
            frame.pos = next_pos;

            if let Some(start) = &self.start_key {
                if !is_leaf {
                    // An interior separator key is an upper bound for its
                    // child; only skip the subtree if the bound still
                    // falls short of the requested start.
                    if (self.cmp)(&key, start) == Ordering::Less {
                        continue;
                    }
                } else if (self.cmp)(&key, start) == Ordering::Less {
                    continue;
                }
            }

            if is_leaf {
                if let Some(end) = &self.end_key {
                    if (self.cmp)(&key, end) == Ordering::Greater {
                        self.done = true;
                        return Ok(None);
                    }
                }
                return Ok(Some((key, value)));
            }

            let child = NodePointer::decode(&value);
            let body = chunk::read_compressed_data_chunk_at(self.file, child.pointer, self.codec)?;
            self.stack.push(Frame { body, pos: 1 });
        }
    }
}

impl<'a, F: Read + Seek> Iterator for TreeWalker<'a, F> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{get_codec, CodecId};
    use crate::compare::id_comparator;
    use crate::tree::modify::{Action, ModifySpec, Modifier};
    use crate::reduce::{by_id_reduce, by_id_re_reduce};
    use std::io::Cursor;

    fn build_tree(items: &[(&str, &str)]) -> (Cursor<Vec<u8>>, Option<NodePointer>) {
        let mut file = Cursor::new(Vec::new());
        let codec = get_codec(CodecId::None);
        let actions: Vec<Action> = items
            .iter()
            .map(|(k, v)| Action::Insert(k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
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
        let (root, _) = modifier.modify_btree(None, actions, &mut tail).unwrap();
        (file, root)
    }

    #[test]
    fn lookup_multi_finds_inserted_keys() {
        let (mut file, root) = build_tree(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let codec = get_codec(CodecId::None);
        let keys = vec![b"a".to_vec(), b"c".to_vec(), b"missing".to_vec()];
        let found = lookup_multi(&mut file, codec.as_ref(), root.as_ref(), &keys, id_comparator).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], (b"a".to_vec(), b"1".to_vec()));
        assert_eq!(found[1], (b"c".to_vec(), b"3".to_vec()));
    }

    #[test]
    fn walker_visits_all_in_order() {
        let (mut file, root) = build_tree(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let codec = get_codec(CodecId::None);
        let walker = TreeWalker::new(&mut file, codec.as_ref(), root.as_ref(), None, id_comparator).unwrap();
        let all: Vec<_> = walker.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, b"a");
        assert_eq!(all[2].0, b"c");
    }

    #[test]
    fn walker_respects_start_key() {
        let (mut file, root) = build_tree(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let codec = get_codec(CodecId::None);
        let walker =
            TreeWalker::new(&mut file, codec.as_ref(), root.as_ref(), Some(b"b".to_vec()), id_comparator).unwrap();
        let from_b: Vec<_> = walker.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(from_b.len(), 2);
        assert_eq!(from_b[0].0, b"b");
    }
}

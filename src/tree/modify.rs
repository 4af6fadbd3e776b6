//! The batched, copy-on-write B+tree modifier.
//!
//! A `Modifier` consumes a sorted batch of fetch/insert/remove actions
//! against an existing root (or `None` for a brand new tree) and produces a
//! new root, writing only the node chunks that actually changed. This is
//! the codec-level workhorse behind every document save and the sorted-tree
//! builder's final assembly step.

use std::cmp::Ordering;
use std::io::{Read, Seek, Write};

use crate::chunk;
use crate::codec::Codec;
use crate::error::{GouchError, Result};
use crate::node::{self, NodePointer, BTREE_INTERIOR, BTREE_LEAF};

pub type Comparator = fn(&[u8], &[u8]) -> Ordering;
pub type ReduceFn = fn(&[&[u8]]) -> Vec<u8>;

#[derive(Debug, Clone)]
pub enum Action {
    Fetch(Vec<u8>),
    Remove(Vec<u8>),
    Insert(Vec<u8>, Vec<u8>),
}

impl Action {
    fn key(&self) -> &[u8] {
        match self {
            Action::Fetch(k) | Action::Remove(k) => k,
            Action::Insert(k, _) => k,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeAction {
    Keep,
    Drop,
    Stop,
    Partial,
}

/// Guided purge callback, consulted for every kv/kp item a modify pass
/// would otherwise keep unchanged. Used by the compactor to drop documents
/// whose sequence predates the purge watermark.
pub trait PurgeHook {
    fn purge_kv(&mut self, key: &[u8], value: &[u8]) -> PurgeAction;
    fn purge_kp(&mut self, ptr: &NodePointer) -> PurgeAction;
}

pub struct ModifySpec<'h> {
    pub cmp: Comparator,
    pub reduce: ReduceFn,
    pub rereduce: ReduceFn,
    pub kv_chunk_threshold: usize,
    pub kp_chunk_threshold: usize,
    /// The compactor flushes full nodes eagerly to bound memory; normal
    /// incremental updates instead batch up to three items before writing
    /// a partial node, so small batches don't fragment the tree.
    pub compacting: bool,
    pub purge: Option<&'h mut dyn PurgeHook>,
}

enum Item {
    Leaf { key: Vec<u8>, value: Vec<u8> },
    Pointer(NodePointer),
}

impl Item {
    fn key(&self) -> &[u8] {
        match self {
            Item::Leaf { key, .. } => key,
            Item::Pointer(p) => &p.key,
        }
    }

    fn encoded_value(&self) -> Vec<u8> {
        match self {
            Item::Leaf { value, .. } => value.clone(),
            Item::Pointer(p) => p.encode(),
        }
    }
}

struct ModifyResult {
    items: Vec<Item>,
    pointers: Vec<NodePointer>,
    node_len: i64,
    node_type: u8,
    modified: bool,
}

impl ModifyResult {
    fn new(node_type: u8) -> Self {
        ModifyResult { items: Vec::new(), pointers: Vec::new(), node_len: 0, node_type, modified: false }
    }
}

/// `(query_key, found_value)` pairs accumulated for every `Action::Fetch`
/// the modify pass walked over — `None` when the key was absent.
pub type FetchResults = Vec<(Vec<u8>, Option<Vec<u8>>)>;

pub struct Modifier<'f, 'h, F> {
    file: &'f mut F,
    codec: &'f dyn Codec,
    spec: ModifySpec<'h>,
    enable_purging: bool,
    fetches: FetchResults,
    tail: u64,
}

impl<'f, 'h, F: Read + Write + Seek> Modifier<'f, 'h, F> {
    pub fn new(file: &'f mut F, codec: &'f dyn Codec, spec: ModifySpec<'h>) -> Self {
        let enable_purging = spec.purge.is_some();
        Modifier { file, codec, spec, enable_purging, fetches: Vec::new(), tail: 0 }
    }

    fn read_node(&mut self, pointer: u64) -> Result<Vec<u8>> {
        chunk::read_compressed_data_chunk_at(self.file, pointer, self.codec)
    }

    pub fn modify_btree(
        mut self,
        root: Option<NodePointer>,
        mut actions: Vec<Action>,
        tail: &mut u64,
    ) -> Result<(Option<NodePointer>, FetchResults)> {
        actions.sort_by(|a, b| (self.spec.cmp)(a.key(), b.key()));
        let mut root_result = ModifyResult::new(BTREE_INTERIOR);
        self.tail = *tail;
        self.modify_node(root.as_ref(), &actions, &mut root_result)?;

        let new_root = if !root_result.modified {
            root
        } else if root_result.items.len() > 1 || !root_result.pointers.is_empty() {
            Some(self.finish_root(root_result)?)
        } else {
            match root_result.items.pop() {
                Some(Item::Pointer(p)) => Some(p),
                Some(Item::Leaf { .. }) => unreachable!("a tree root item is always a node pointer"),
                None => None,
            }
        };

        *tail = self.tail;
        Ok((new_root, self.fetches))
    }

    fn modify_node(&mut self, np: Option<&NodePointer>, actions: &[Action], dst: &mut ModifyResult) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }

        let nodebuf = match np {
            Some(p) => Some(self.read_node(p.pointer)?),
            None => None,
        };

        if let Some(b) = &nodebuf {
            if b[0] != BTREE_LEAF && b[0] != BTREE_INTERIOR {
                return Err(GouchError::InvalidBtreeNodeType);
            }
        }

        let mut local = ModifyResult::new(match &nodebuf {
            Some(b) => b[0],
            None => BTREE_LEAF,
        });

        let mut start = 0usize;

        match &nodebuf {
            None => {
                self.apply_tail_actions(actions, &mut local)?;
            }
            Some(buf) if buf[0] == BTREE_LEAF => {
                let mut pos = 1usize;
                while pos < buf.len() {
                    let (cmp_key, val_buf, next_pos) = node::decode_key_value(buf, pos);
                    pos = next_pos;
                    let mut advance = false;
                    while !advance && start < actions.len() {
                        advance = true;
                        match (self.spec.cmp)(cmp_key, actions[start].key()) {
                            Ordering::Less => {
                                self.maybe_purge_kv(cmp_key, val_buf, &mut local)?;
                            }
                            Ordering::Greater => {
                                self.apply_leaf_miss(&actions[start], &mut local)?;
                                start += 1;
                                advance = false;
                            }
                            Ordering::Equal => {
                                self.apply_leaf_hit(&actions[start], val_buf, &mut local)?;
                                if matches!(actions[start], Action::Fetch(_)) {
                                    advance = false;
                                }
                                start += 1;
                            }
                        }
                    }
                    if start == actions.len() && !advance {
                        self.maybe_purge_kv(cmp_key, val_buf, &mut local)?;
                    }
                }
                self.apply_tail_actions(&actions[start..], &mut local)?;
                start = actions.len();
            }
            Some(buf) => {
                let mut pos = 1usize;
                while pos < buf.len() && start < actions.len() {
                    let (cmp_key, val_buf, next_pos) = node::decode_key_value(buf, pos);
                    let is_last = next_pos == buf.len();
                    if is_last {
                        let mut desc = NodePointer::decode(val_buf);
                        desc.key = cmp_key.to_vec();
                        self.modify_node(Some(&desc), &actions[start..], &mut local)?;
                        start = actions.len();
                        pos = next_pos;
                        break;
                    }

                    if (self.spec.cmp)(cmp_key, actions[start].key()) == Ordering::Less {
                        let mut add = NodePointer::decode(val_buf);
                        add.key = cmp_key.to_vec();
                        self.maybe_purge_kp(add, &mut local)?;
                    } else {
                        let mut range_end = start;
                        while range_end < actions.len()
                            && (self.spec.cmp)(actions[range_end].key(), cmp_key) != Ordering::Greater
                        {
                            range_end += 1;
                        }
                        let mut desc = NodePointer::decode(val_buf);
                        desc.key = cmp_key.to_vec();
                        self.modify_node(Some(&desc), &actions[start..range_end], &mut local)?;
                        start = range_end;
                    }
                    pos = next_pos;
                }
                while pos < buf.len() {
                    let (cmp_key, val_buf, next_pos) = node::decode_key_value(buf, pos);
                    let mut add = NodePointer::decode(val_buf);
                    add.key = cmp_key.to_vec();
                    self.maybe_purge_kp(add, &mut local)?;
                    pos = next_pos;
                }
            }
        }
        let _ = start;

        self.flush(&mut local)?;
        if !local.modified {
            if let Some(p) = np {
                self.push_pointer_info(p.clone(), dst)?;
            }
        } else {
            dst.modified = true;
            self.move_pointers(&mut local, dst)?;
        }
        Ok(())
    }

    fn apply_leaf_hit(&mut self, action: &Action, found_value: &[u8], local: &mut ModifyResult) -> Result<()> {
        match action {
            Action::Insert(k, v) => {
                local.modified = true;
                self.push_item(k.clone(), v.clone(), local)?;
            }
            Action::Remove(_) => {
                local.modified = true;
            }
            Action::Fetch(k) => {
                self.fetches.push((k.clone(), Some(found_value.to_vec())));
            }
        }
        Ok(())
    }

    fn apply_leaf_miss(&mut self, action: &Action, local: &mut ModifyResult) -> Result<()> {
        match action {
            Action::Insert(k, v) => {
                local.modified = true;
                self.push_item(k.clone(), v.clone(), local)?;
            }
            Action::Remove(_) => {
                local.modified = true;
            }
            Action::Fetch(k) => {
                self.fetches.push((k.clone(), None));
            }
        }
        Ok(())
    }

    fn apply_tail_actions(&mut self, actions: &[Action], local: &mut ModifyResult) -> Result<()> {
        for action in actions {
            self.apply_leaf_miss(action, local)?;
        }
        Ok(())
    }

    fn maybe_purge_kv(&mut self, key: &[u8], val: &[u8], res: &mut ModifyResult) -> Result<()> {
        let action = if self.enable_purging {
            if let Some(hook) = self.spec.purge.as_deref_mut() {
                hook.purge_kv(key, val)
            } else {
                PurgeAction::Keep
            }
        } else {
            PurgeAction::Keep
        };
        match action {
            PurgeAction::Drop => res.modified = true,
            PurgeAction::Stop => self.enable_purging = false,
            PurgeAction::Keep | PurgeAction::Partial => self.push_item(key.to_vec(), val.to_vec(), res)?,
        }
        Ok(())
    }

    fn maybe_purge_kp(&mut self, np: NodePointer, res: &mut ModifyResult) -> Result<()> {
        let action = if self.enable_purging {
            if let Some(hook) = self.spec.purge.as_deref_mut() {
                hook.purge_kp(&np)
            } else {
                PurgeAction::Keep
            }
        } else {
            PurgeAction::Keep
        };
        match action {
            PurgeAction::Drop => res.modified = true,
            PurgeAction::Partial => self.purge_node(np, res)?,
            PurgeAction::Stop => {
                self.enable_purging = false;
                self.push_pointer_info(np, res)?;
            }
            PurgeAction::Keep => self.push_pointer_info(np, res)?,
        }
        Ok(())
    }

    fn purge_node(&mut self, np: NodePointer, dst: &mut ModifyResult) -> Result<()> {
        if !self.enable_purging {
            dst.modified = true;
            return self.push_pointer_info(np, dst);
        }

        let nodebuf = self.read_node(np.pointer)?;
        let mut local = ModifyResult::new(nodebuf[0]);
        let mut pos = 1usize;
        if nodebuf[0] == BTREE_LEAF {
            while pos < nodebuf.len() {
                let (cmp_key, val_buf, next_pos) = node::decode_key_value(&nodebuf, pos);
                self.maybe_purge_kv(cmp_key, val_buf, &mut local)?;
                pos = next_pos;
            }
        } else {
            while pos < nodebuf.len() {
                let (cmp_key, val_buf, next_pos) = node::decode_key_value(&nodebuf, pos);
                let mut desc = NodePointer::decode(val_buf);
                desc.key = cmp_key.to_vec();
                self.maybe_purge_kp(desc, &mut local)?;
                pos = next_pos;
            }
        }

        if local.modified {
            self.flush(&mut local)?;
            dst.modified = true;
            self.move_pointers(&mut local, dst)?;
        }
        Ok(())
    }

    fn push_item(&mut self, key: Vec<u8>, value: Vec<u8>, dst: &mut ModifyResult) -> Result<()> {
        dst.node_len += (key.len() + value.len() + node::KEY_VALUE_LEN) as i64;
        dst.items.push(Item::Leaf { key, value });
        self.maybe_flush(dst)
    }

    fn push_pointer_info(&mut self, ptr: NodePointer, dst: &mut ModifyResult) -> Result<()> {
        let encoded_len = ptr.encode().len();
        dst.node_len += (ptr.key.len() + encoded_len + node::KEY_VALUE_LEN) as i64;
        dst.items.push(Item::Pointer(ptr));
        self.maybe_flush(dst)
    }

    fn move_pointers(&mut self, src: &mut ModifyResult, dst: &mut ModifyResult) -> Result<()> {
        for ptr in src.pointers.drain(..) {
            self.push_pointer_info(ptr, dst)?;
        }
        Ok(())
    }

    fn maybe_flush(&mut self, mr: &mut ModifyResult) -> Result<()> {
        if self.spec.compacting {
            let threshold = if mr.node_type == BTREE_LEAF {
                self.spec.kv_chunk_threshold
            } else {
                self.spec.kp_chunk_threshold
            };
            if mr.modified && mr.node_len > (threshold * 2 / 3) as i64 {
                self.flush(mr)?;
            }
        } else if mr.modified && mr.items.len() > 3 {
            if mr.node_type == BTREE_LEAF && mr.node_len > self.spec.kv_chunk_threshold as i64 {
                self.flush_partial(mr, (self.spec.kv_chunk_threshold * 2 / 3) as i64)?;
            } else if mr.node_type == BTREE_INTERIOR && mr.node_len > self.spec.kp_chunk_threshold as i64 {
                self.flush_partial(mr, (self.spec.kp_chunk_threshold * 2 / 3) as i64)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self, mr: &mut ModifyResult) -> Result<()> {
        self.flush_partial(mr, mr.node_len)
    }

    /// Writes one node using items from the front of `res.items` until
    /// `quota` (in encoded bytes) is exhausted — unless fewer than two
    /// interior items have been collected yet, in which case it keeps
    /// going regardless of quota so an interior node is never left with a
    /// single child.
    fn flush_partial(&mut self, res: &mut ModifyResult, mut quota: i64) -> Result<()> {
        if !res.modified || res.items.is_empty() {
            return Ok(());
        }

        let mut nodebuf = vec![res.node_type];
        let mut subtree_size: u64 = 0;
        let mut taken = 0usize;
        let mut leaf_values: Vec<Vec<u8>> = Vec::new();
        let mut child_reduced: Vec<Vec<u8>> = Vec::new();
        let mut final_key = Vec::new();

        for item in res.items.iter() {
            if !(quota > 0 || (taken < 2 && res.node_type == BTREE_INTERIOR)) {
                break;
            }
            let value = item.encoded_value();
            nodebuf.extend(node::encode_key_value(item.key(), &value));
            match item {
                Item::Pointer(p) => {
                    subtree_size += p.subtree_size;
                    child_reduced.push(p.reduced_value.clone());
                }
                Item::Leaf { value, .. } => leaf_values.push(value.clone()),
            }
            quota -= (item.key().len() + value.len() + node::KEY_VALUE_LEN) as i64;
            final_key = item.key().to_vec();
            taken += 1;
        }

        if taken == 0 {
            return Ok(());
        }

        let consumed_node_len = nodebuf.len() as i64 - 1;
        let compressed = self.codec.encode(&nodebuf)?;
        let (diskpos, disk_size) = self.append(&compressed)?;

        let reduced_value = if res.node_type == BTREE_LEAF {
            let refs: Vec<&[u8]> = leaf_values.iter().map(|v| v.as_slice()).collect();
            (self.spec.reduce)(&refs)
        } else {
            let refs: Vec<&[u8]> = child_reduced.iter().map(|v| v.as_slice()).collect();
            (self.spec.rereduce)(&refs)
        };

        let ptr = NodePointer {
            key: final_key,
            pointer: diskpos,
            reduced_value,
            subtree_size: subtree_size + disk_size,
        };
        res.pointers.push(ptr);
        res.node_len -= consumed_node_len;
        res.items.drain(0..taken);

        Ok(())
    }

    fn finish_root(&mut self, mut root_result: ModifyResult) -> Result<NodePointer> {
        let mut collector = ModifyResult::new(BTREE_INTERIOR);
        collector.modified = true;
        self.flush(&mut root_result)?;
        loop {
            if root_result.pointers.len() == 1 {
                return Ok(root_result.pointers.pop().unwrap());
            }
            self.move_pointers(&mut root_result, &mut collector)?;
            self.flush(&mut collector)?;
            std::mem::swap(&mut root_result, &mut collector);
        }
    }

    fn append(&mut self, buf: &[u8]) -> Result<(u64, u64)> {
        let (pos, consumed) = chunk::write_chunk_at(self.file, self.tail, buf, false)?;
        self.tail += consumed;
        Ok((pos, consumed))
    }
}

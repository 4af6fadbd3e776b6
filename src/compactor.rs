//! Offline compaction: stream-copy live documents into a fresh file and
//! rebuild both indexes from scratch, bypassing the general-purpose
//! modifier in favor of the sorted-tree builders (see
//! [`crate::tree::builder`]).
//!
//! The source is read in ascending sequence order — the natural order for
//! a live-document scan — and every kept document's body chunk is copied
//! verbatim (no recompression) into the target before its rewritten index
//! entries are staged. Both new trees are then assembled in one pass, and
//! the target is committed.

use std::path::Path;

use crate::chunk;
use crate::codec::{get_codec, Codec};
use crate::compare::{id_comparator, seq_comparator};
use crate::config::SortStrategy;
use crate::engine::{DocumentInfo, Gouch};
use crate::error::Result;
use crate::node::{ByIdValue, BySeqValue, NodePointer};
use crate::raw::decode_raw48;
use crate::reduce::{by_id_re_reduce, by_id_reduce, by_seq_re_reduce, by_seq_reduce, local_docs_re_reduce, local_docs_reduce};
use crate::tree::builder::{Comparator, InMemoryTreeBuilder, OnDiskTreeBuilder, ReduceFn};
use crate::tree::lookup::TreeWalker;

/// Per-document decision returned by a [`CompactHook`]. Mirrors the
/// couchstore original's `COMPACT_KEEP_ITEM`/`COMPACT_DROP_ITEM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactAction {
    Keep,
    Drop,
}

/// Lets a caller filter documents out of a compaction as they stream past,
/// e.g. to implement a purge-by-age policy. The default (no hook) keeps
/// everything.
pub trait CompactHook {
    fn decide(&mut self, info: &DocumentInfo) -> CompactAction;
}

struct KeepAll;
impl CompactHook for KeepAll {
    fn decide(&mut self, _info: &DocumentInfo) -> CompactAction {
        CompactAction::Keep
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionStats {
    pub documents_copied: u64,
    pub documents_dropped: u64,
    pub local_docs_copied: u64,
}

/// Assembles either tree-building strategy behind one interface so the
/// compactor doesn't need to duplicate its staging logic per strategy —
/// both builders in [`crate::tree::builder`] expose the same shape, just
/// with a different `add_item` signature.
enum SortedBuilder {
    InMemory(InMemoryTreeBuilder),
    OnDisk(OnDiskTreeBuilder),
}

impl SortedBuilder {
    fn new(strategy: SortStrategy, cmp: Comparator) -> Result<Self> {
        Ok(match strategy {
            SortStrategy::InMemory => SortedBuilder::InMemory(InMemoryTreeBuilder::new(cmp)),
            SortStrategy::OnDisk => SortedBuilder::OnDisk(OnDiskTreeBuilder::new(cmp)?),
        })
    }

    fn add_item(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        match self {
            SortedBuilder::InMemory(b) => {
                b.add_item(key, value);
                Ok(())
            }
            SortedBuilder::OnDisk(b) => b.add_item(&key, &value),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        self,
        file: &mut std::fs::File,
        codec: &dyn Codec,
        reduce: ReduceFn,
        rereduce: ReduceFn,
        kv_chunk_threshold: usize,
        kp_chunk_threshold: usize,
        tail: &mut u64,
    ) -> Result<Option<NodePointer>> {
        match self {
            SortedBuilder::InMemory(b) => b.write(file, codec, reduce, rereduce, kv_chunk_threshold, kp_chunk_threshold, tail),
            SortedBuilder::OnDisk(b) => b.write(file, codec, reduce, rereduce, kv_chunk_threshold, kp_chunk_threshold, tail),
        }
    }
}

/// Rewrites `source` into a brand new database at `target_path`.
///
/// Mirrors couchstore's `Compact`: the target inherits `update_seq` and
/// `purge_ptr` verbatim and bumps `purge_seq` by one. By-seq is walked in
/// ascending order; every kept, non-deleted document's body chunk is
/// copied byte-for-byte (no recompression), and rewritten by-id/by-seq
/// entries are staged into fresh sorted-tree builders. Local documents are
/// copied the same way into a third tree — the upstream Go implementation
/// never finished this step (`compactLocalDocsTree` is a stub there); this
/// port completes it, see `SPEC_FULL.md` §3.
pub fn compact(source: &mut Gouch, target_path: impl AsRef<Path>, hook: Option<&mut dyn CompactHook>) -> Result<CompactionStats> {
    let target_path = target_path.as_ref();
    tracing::info!(from = %source.path().display(), to = %target_path.display(), "starting compaction");
    let mut keep_all = KeepAll;
    let hook: &mut dyn CompactHook = match hook {
        Some(h) => h,
        None => &mut keep_all,
    };

    let src_by_seq_root = source.header().by_seq_root.clone();
    let src_local_root = source.header().local_docs_root.clone();
    let update_seq = source.header().update_seq;
    let purge_seq = source.header().purge_seq;
    let purge_ptr = source.header().purge_ptr;
    let sort_strategy = source.config().sort_strategy;

    let mut target = Gouch::open(target_path, true, source.config().clone())?;
    {
        let mut header = target.header().clone();
        header.update_seq = update_seq;
        header.purge_seq = purge_seq + 1;
        header.purge_ptr = purge_ptr;
        target.set_header(header);
    }

    let mut stats = CompactionStats::default();

    // Materialize the source's by-seq entries up front: a lazy TreeWalker
    // holds a mutable borrow of the source file for its whole lifetime, and
    // copying a document's body chunk needs that file back mid-walk. This
    // is the "iterator, not a cyclic callback" redesign from SPEC_FULL §4.5
    // carried to its natural conclusion for compaction.
    let mut seq_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    if let Some(root) = &src_by_seq_root {
        let (src_file, src_codec) = source.file_and_codec();
        let walker = TreeWalker::new(src_file, src_codec, Some(root), None, seq_comparator)?;
        for item in walker {
            seq_entries.push(item?);
        }
    }

    let mut seq_builder = SortedBuilder::new(sort_strategy, seq_comparator)?;
    let mut id_builder = SortedBuilder::new(sort_strategy, id_comparator)?;

    for (seq_key, raw_val) in seq_entries {
        let bsv = BySeqValue::decode(&raw_val);
        let seq = decode_raw48(&seq_key);
        let info = DocumentInfo {
            id: bsv.id.clone(),
            seq,
            rev: bsv.rev,
            rev_meta: bsv.rev_meta.clone(),
            content_meta: bsv.content_meta,
            deleted: bsv.deleted,
            size: bsv.size,
            body_position: bsv.body_offset,
        };

        if hook.decide(&info) == CompactAction::Drop {
            stats.documents_dropped += 1;
            continue;
        }

        let new_body_offset = if !bsv.deleted && bsv.body_offset != 0 {
            let raw_chunk = chunk::read_chunk_at(source.file_mut(), bsv.body_offset, false)?;
            let (pos, consumed) = chunk::write_chunk_at(target.file_mut(), target.tail(), &raw_chunk, false)?;
            target.set_tail(target.tail() + consumed);
            pos
        } else {
            0
        };

        let new_seq_value = BySeqValue {
            id: bsv.id.clone(),
            size: bsv.size,
            deleted: bsv.deleted,
            body_offset: new_body_offset,
            rev: bsv.rev,
            content_meta: bsv.content_meta,
            rev_meta: bsv.rev_meta.clone(),
        }
        .encode();
        seq_builder.add_item(seq_key, new_seq_value)?;

        let new_id_value = ByIdValue {
            seq,
            size: bsv.size,
            deleted: bsv.deleted,
            body_offset: new_body_offset,
            rev: bsv.rev,
            content_meta: bsv.content_meta,
            rev_meta: bsv.rev_meta,
        }
        .encode();
        id_builder.add_item(bsv.id, new_id_value)?;
        stats.documents_copied += 1;
    }

    let mut local_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    if let Some(root) = &src_local_root {
        let (src_file, src_codec) = source.file_and_codec();
        let walker = TreeWalker::new(src_file, src_codec, Some(root), None, id_comparator)?;
        for item in walker {
            local_entries.push(item?);
        }
    }
    let mut local_builder = SortedBuilder::new(sort_strategy, id_comparator)?;
    for (id, raw_val) in local_entries {
        // Local-doc values carry no body offsets to rewrite — copy verbatim.
        local_builder.add_item(id, raw_val)?;
        stats.local_docs_copied += 1;
    }

    let codec = get_codec(target.codec().codec_id());
    let kv_chunk_threshold = target.config().kv_chunk_threshold;
    let kp_chunk_threshold = target.config().kp_chunk_threshold;
    let mut tail = target.tail();

    let by_seq_root = seq_builder.write(
        target.file_mut(),
        codec.as_ref(),
        by_seq_reduce,
        by_seq_re_reduce,
        kv_chunk_threshold,
        kp_chunk_threshold,
        &mut tail,
    )?;
    let by_id_root = id_builder.write(
        target.file_mut(),
        codec.as_ref(),
        by_id_reduce,
        by_id_re_reduce,
        kv_chunk_threshold,
        kp_chunk_threshold,
        &mut tail,
    )?;
    let local_docs_root = local_builder.write(
        target.file_mut(),
        codec.as_ref(),
        local_docs_reduce,
        local_docs_re_reduce,
        kv_chunk_threshold,
        kp_chunk_threshold,
        &mut tail,
    )?;
    target.set_tail(tail);

    let mut header = target.header().clone();
    header.by_seq_root = by_seq_root;
    header.by_id_root = by_id_root;
    header.local_docs_root = local_docs_root;
    target.set_header(header);

    target.commit()?;
    tracing::info!(
        copied = stats.documents_copied,
        dropped = stats.documents_dropped,
        local_docs = stats.local_docs_copied,
        "compaction finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Document;
    use tempfile::tempdir;

    #[test]
    fn compacted_database_preserves_live_documents() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src.couch");
        let dst_path = dir.path().join("dst.couch");

        let mut src = Gouch::open(&src_path, true, crate::config::EngineConfig::default()).unwrap();
        for i in 0..10 {
            let id = format!("doc-{i}");
            let doc = Document { id: id.clone().into_bytes(), body: format!("body-{i}").into_bytes() };
            let mut info = DocumentInfo::new(doc.id.clone());
            src.save_document(Some(&doc), &mut info).unwrap();
        }
        // delete one document so compaction has something to drop the body for.
        let mut del_info = src.document_info_by_id(b"doc-3").unwrap();
        src.save_document(None, &mut del_info).unwrap();
        src.commit().unwrap();

        let stats = src.compact(&dst_path, None).unwrap();
        assert_eq!(stats.documents_copied, 10);

        let mut dst = Gouch::open(&dst_path, false, crate::config::EngineConfig::default()).unwrap();
        for i in 0..10 {
            let id = format!("doc-{i}");
            let info = dst.document_info_by_id(id.as_bytes()).unwrap();
            if i == 3 {
                assert!(info.deleted);
            } else {
                let doc = dst.document_by_document_info(&info).unwrap();
                assert_eq!(doc.body, format!("body-{i}").into_bytes());
            }
        }
    }

    #[test]
    fn compaction_hook_can_drop_documents() {
        struct DropEven;
        impl CompactHook for DropEven {
            fn decide(&mut self, info: &DocumentInfo) -> CompactAction {
                if info.seq % 2 == 0 { CompactAction::Drop } else { CompactAction::Keep }
            }
        }

        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src.couch");
        let dst_path = dir.path().join("dst.couch");
        let mut src = Gouch::open(&src_path, true, crate::config::EngineConfig::default()).unwrap();
        for i in 0..6 {
            let doc = Document { id: format!("d{i}").into_bytes(), body: b"x".to_vec() };
            let mut info = DocumentInfo::new(doc.id.clone());
            src.save_document(Some(&doc), &mut info).unwrap();
        }
        src.commit().unwrap();

        let mut hook = DropEven;
        let stats = src.compact(&dst_path, Some(&mut hook)).unwrap();
        assert_eq!(stats.documents_copied, 3);
        assert_eq!(stats.documents_dropped, 3);
    }

    #[test]
    fn compaction_preserves_local_documents() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src.couch");
        let dst_path = dir.path().join("dst.couch");
        let mut src = Gouch::open(&src_path, true, crate::config::EngineConfig::default()).unwrap();
        src.save_local_document(&crate::engine::LocalDocument {
            id: b"_local/checkpoint".to_vec(),
            body: b"{\"seq\":1}".to_vec(),
            deleted: false,
        })
        .unwrap();
        src.commit().unwrap();

        src.compact(&dst_path, None).unwrap();
        let mut dst = Gouch::open(&dst_path, false, crate::config::EngineConfig::default()).unwrap();
        let local = dst.local_document_by_id(b"_local/checkpoint").unwrap();
        assert_eq!(local.body, b"{\"seq\":1}");
    }
}

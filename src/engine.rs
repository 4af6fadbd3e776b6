//! The `Gouch` database handle: the public API surface tying together the
//! block/chunk/node layers, the two-phase header commit protocol, and the
//! B+tree read/write paths.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::chunk;
use crate::codec::{get_codec, Codec, CodecId};
use crate::compare::{id_comparator, seq_comparator};
use crate::config::EngineConfig;
use crate::error::{GouchError, Result};
use crate::header::{self, Header};
use crate::node::{self, ByIdValue, BySeqValue, LocalDocValue, NodePointer};
use crate::raw::{decode_raw48, encode_raw48};
use crate::reduce::{
    by_id_re_reduce, by_id_reduce, by_seq_re_reduce, by_seq_reduce, local_docs_re_reduce, local_docs_reduce,
};
use crate::tree::lookup::{lookup_multi, TreeWalker};
use crate::tree::modify::{Action, Modifier, ModifySpec};

pub const DOC_IS_COMPRESSED: u8 = 128;

/// An in-memory document body paired with its identifier.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Vec<u8>,
    pub body: Vec<u8>,
}

/// Document metadata as carried in the by-id and by-seq trees.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: Vec<u8>,
    pub seq: u64,
    pub rev: u64,
    pub rev_meta: Vec<u8>,
    pub content_meta: u8,
    pub deleted: bool,
    pub size: u32,
    pub body_position: u64,
}

impl DocumentInfo {
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        DocumentInfo {
            id: id.into(),
            seq: 0,
            rev: 1,
            rev_meta: Vec::new(),
            content_meta: 0,
            deleted: false,
            size: 0,
            body_position: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.content_meta & DOC_IS_COMPRESSED != 0
    }

    fn encode_by_id(&self) -> Vec<u8> {
        ByIdValue {
            seq: self.seq,
            size: self.size,
            deleted: self.deleted,
            body_offset: self.body_position,
            rev: self.rev,
            content_meta: self.content_meta,
            rev_meta: self.rev_meta.clone(),
        }
        .encode()
    }

    fn encode_by_seq(&self) -> Vec<u8> {
        BySeqValue {
            id: self.id.clone(),
            size: self.size,
            deleted: self.deleted,
            body_offset: self.body_position,
            rev: self.rev,
            content_meta: self.content_meta,
            rev_meta: self.rev_meta.clone(),
        }
        .encode()
    }

    fn from_by_id(id: Vec<u8>, raw: &[u8]) -> Self {
        let v = ByIdValue::decode(raw);
        DocumentInfo {
            id,
            seq: v.seq,
            rev: v.rev,
            rev_meta: v.rev_meta,
            content_meta: v.content_meta,
            deleted: v.deleted,
            size: v.size,
            body_position: v.body_offset,
        }
    }

    fn from_by_seq(seq_key: &[u8], raw: &[u8]) -> Self {
        let v = BySeqValue::decode(raw);
        DocumentInfo {
            id: v.id,
            seq: decode_raw48(seq_key),
            rev: v.rev,
            rev_meta: v.rev_meta,
            content_meta: v.content_meta,
            deleted: v.deleted,
            size: v.size,
            body_position: v.body_offset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalDocument {
    pub id: Vec<u8>,
    pub body: Vec<u8>,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub file_name: PathBuf,
    pub last_seq: u64,
    pub document_count: u64,
    pub deleted_count: u64,
    pub space_used: u64,
    pub file_size: u64,
    pub header_position: u64,
}

pub struct Gouch {
    file: File,
    path: PathBuf,
    codec: Box<dyn Codec>,
    header: Header,
    tail: u64,
    config: EngineConfig,
}

impl Gouch {
    /// Opens an existing database, or creates one if `create` is set and
    /// the file is empty/missing.
    pub fn open(path: impl AsRef<Path>, create: bool, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(true);
        if create {
            open_opts.create(true);
        }
        let mut file = open_opts.open(&path)?;
        let len = file.seek(SeekFrom::End(0))?;

        let codec = get_codec(CodecId::Snappy);

        let (header, tail) = if len == 0 {
            info!(path = %path.display(), "creating new database");
            let header = Header::empty();
            let (pos, consumed) = chunk::write_chunk_at(&mut file, 0, &header.encode(), true)?;
            let mut header = header;
            header.position = pos;
            (header, consumed)
        } else {
            debug!(path = %path.display(), "recovering last header");
            let header = header::find_last_header(&mut file, len)?;
            (header, len)
        };

        Ok(Gouch { file, path, codec, header, tail, config })
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }

    // ---- reads ----------------------------------------------------------

    pub fn document_info_by_id(&mut self, id: &[u8]) -> Result<DocumentInfo> {
        let keys = vec![id.to_vec()];
        let found = lookup_multi(&mut self.file, self.codec.as_ref(), self.header.by_id_root.as_ref(), &keys, id_comparator)?;
        found
            .into_iter()
            .next()
            .map(|(k, v)| DocumentInfo::from_by_id(k, &v))
            .ok_or(GouchError::DocumentNotFound)
    }

    pub fn document_infos_by_ids(&mut self, ids: &[Vec<u8>]) -> Result<Vec<DocumentInfo>> {
        let mut keys = ids.to_vec();
        keys.sort();
        let found = lookup_multi(&mut self.file, self.codec.as_ref(), self.header.by_id_root.as_ref(), &keys, id_comparator)?;
        Ok(found.into_iter().map(|(k, v)| DocumentInfo::from_by_id(k, &v)).collect())
    }

    pub fn document_info_by_seq(&mut self, seq: u64) -> Result<DocumentInfo> {
        let keys = vec![encode_raw48(seq).to_vec()];
        let found = lookup_multi(&mut self.file, self.codec.as_ref(), self.header.by_seq_root.as_ref(), &keys, seq_comparator)?;
        found
            .into_iter()
            .next()
            .map(|(k, v)| DocumentInfo::from_by_seq(&k, &v))
            .ok_or(GouchError::DocumentNotFound)
    }

    pub fn document_infos_by_seqs(&mut self, seqs: &[u64]) -> Result<Vec<DocumentInfo>> {
        let mut sorted = seqs.to_vec();
        sorted.sort_unstable();
        let keys: Vec<Vec<u8>> = sorted.iter().map(|s| encode_raw48(*s).to_vec()).collect();
        let found = lookup_multi(&mut self.file, self.codec.as_ref(), self.header.by_seq_root.as_ref(), &keys, seq_comparator)?;
        Ok(found.into_iter().map(|(k, v)| DocumentInfo::from_by_seq(&k, &v)).collect())
    }

    pub fn document_by_document_info(&mut self, info: &DocumentInfo) -> Result<Document> {
        let body = if info.is_compressed() {
            chunk::read_compressed_data_chunk_at(&mut self.file, info.body_position, self.codec.as_ref())?
        } else {
            chunk::read_chunk_at(&mut self.file, info.body_position, false)?
        };
        Ok(Document { id: info.id.clone(), body })
    }

    pub fn document_by_id(&mut self, id: &[u8]) -> Result<Document> {
        let info = self.document_info_by_id(id)?;
        self.document_by_document_info(&info)
    }

    pub fn document_body_by_id(&mut self, id: &[u8]) -> Result<Vec<u8>> {
        Ok(self.document_by_id(id)?.body)
    }

    /// Iterates all documents in ascending id order, optionally bounded
    /// (inclusive) by `start_id`/`end_id`.
    pub fn all_documents(
        &mut self,
        start_id: Option<&[u8]>,
        end_id: Option<&[u8]>,
    ) -> Result<TreeWalker<'_, File>> {
        TreeWalker::new_bounded(
            &mut self.file,
            self.codec.as_ref(),
            self.header.by_id_root.as_ref(),
            start_id.map(|s| s.to_vec()),
            end_id.map(|e| e.to_vec()),
            id_comparator,
        )
    }

    /// Iterates all documents in ascending sequence order, optionally
    /// bounded (inclusive) by `since`/`till`. `till == 0` means unbounded.
    pub fn changes_since(&mut self, since: u64, till: u64) -> Result<TreeWalker<'_, File>> {
        let end = if till == 0 { None } else { Some(encode_raw48(till).to_vec()) };
        TreeWalker::new_bounded(
            &mut self.file,
            self.codec.as_ref(),
            self.header.by_seq_root.as_ref(),
            Some(encode_raw48(since).to_vec()),
            end,
            seq_comparator,
        )
    }

    pub fn walk_local_docs(&mut self) -> Result<TreeWalker<'_, File>> {
        TreeWalker::new(&mut self.file, self.codec.as_ref(), self.header.local_docs_root.as_ref(), None, id_comparator)
    }

    pub fn local_document_by_id(&mut self, id: &[u8]) -> Result<LocalDocument> {
        let keys = vec![id.to_vec()];
        let found = lookup_multi(
            &mut self.file,
            self.codec.as_ref(),
            self.header.local_docs_root.as_ref(),
            &keys,
            id_comparator,
        )?;
        found
            .into_iter()
            .next()
            .map(|(k, v)| {
                let decoded = LocalDocValue::decode(&v);
                LocalDocument { id: k, body: decoded.body, deleted: decoded.deleted }
            })
            .ok_or(GouchError::DocumentNotFound)
    }

    // ---- writes -----------------------------------------------------------

    fn write_body(&mut self, body: &[u8], compress: bool) -> Result<(u64, u32)> {
        let (pos, size) = if compress {
            let compressed = self.codec.encode(body)?;
            chunk::write_chunk_at(&mut self.file, self.tail, &compressed, false)?
        } else {
            chunk::write_chunk_at(&mut self.file, self.tail, body, false)?
        };
        self.tail += size;
        Ok((pos, size as u32))
    }

    /// Appends one document, assigning it the next sequence number.
    pub fn save_document(&mut self, doc: Option<&Document>, info: &mut DocumentInfo) -> Result<()> {
        self.save_documents(&[doc], std::slice::from_mut(info))
    }

    /// Appends a batch of documents in one tree update pass. A `None` body
    /// marks a tombstone (the info's `deleted` flag is set and no body
    /// chunk is written).
    pub fn save_documents(&mut self, docs: &[Option<&Document>], infos: &mut [DocumentInfo]) -> Result<()> {
        assert_eq!(docs.len(), infos.len());
        debug!(batch_size = docs.len(), starting_seq = self.header.update_seq + 1, "saving document batch");
        let mut seq = self.header.update_seq;

        let mut seq_keys = Vec::with_capacity(docs.len());
        let mut seq_vals = Vec::with_capacity(docs.len());
        let mut id_keys = Vec::with_capacity(docs.len());
        let mut id_vals = Vec::with_capacity(docs.len());

        for (doc, info) in docs.iter().zip(infos.iter_mut()) {
            seq += 1;
            info.seq = seq;
            match doc {
                Some(d) => {
                    let (pos, size) = self.write_body(&d.body, info.is_compressed())?;
                    info.body_position = pos;
                    info.size = size;
                    info.deleted = false;
                }
                None => {
                    info.deleted = true;
                    info.body_position = 0;
                    info.size = 0;
                }
            }
            seq_keys.push(encode_raw48(info.seq).to_vec());
            seq_vals.push(info.encode_by_seq());
            id_keys.push(info.id.clone());
            id_vals.push(info.encode_by_id());
        }

        self.update_indexes(&seq_keys, &seq_vals, &id_keys, &id_vals)?;
        self.header.update_seq = seq;
        Ok(())
    }

    fn update_indexes(
        &mut self,
        seq_keys: &[Vec<u8>],
        seq_vals: &[Vec<u8>],
        id_keys: &[Vec<u8>],
        id_vals: &[Vec<u8>],
    ) -> Result<()> {
        let numdocs = id_keys.len();
        let mut paired: Vec<(usize, &Vec<u8>)> = id_keys.iter().enumerate().collect();
        paired.sort_by(|a, b| id_comparator(a.1, b.1));

        let mut id_actions = Vec::with_capacity(numdocs * 2);
        for (i, _) in &paired {
            id_actions.push(Action::Fetch(id_keys[*i].clone()));
            id_actions.push(Action::Insert(id_keys[*i].clone(), id_vals[*i].clone()));
        }

        let id_spec = ModifySpec {
            cmp: id_comparator,
            reduce: by_id_reduce,
            rereduce: by_id_re_reduce,
            kv_chunk_threshold: self.config.kv_chunk_threshold,
            kp_chunk_threshold: self.config.kp_chunk_threshold,
            compacting: false,
            purge: None,
        };
        let id_modifier = Modifier::new(&mut self.file, self.codec.as_ref(), id_spec);
        let mut tail = self.tail;
        let (new_id_root, fetches) = id_modifier.modify_btree(self.header.by_id_root.clone(), id_actions, &mut tail)?;
        self.tail = tail;

        let mut seq_actions: Vec<Action> = Vec::with_capacity(numdocs * 2);
        for (_, found) in fetches {
            if let Some(old_id_val) = found {
                let old = ByIdValue::decode(&old_id_val);
                seq_actions.push(Action::Remove(encode_raw48(old.seq).to_vec()));
            }
        }
        for (k, v) in seq_keys.iter().zip(seq_vals.iter()) {
            seq_actions.push(Action::Insert(k.clone(), v.clone()));
        }
        seq_actions.sort_by(|a, b| seq_comparator(action_key(a), action_key(b)));

        let seq_spec = ModifySpec {
            cmp: seq_comparator,
            reduce: by_seq_reduce,
            rereduce: by_seq_re_reduce,
            kv_chunk_threshold: self.config.kv_chunk_threshold,
            kp_chunk_threshold: self.config.kp_chunk_threshold,
            compacting: false,
            purge: None,
        };
        let seq_modifier = Modifier::new(&mut self.file, self.codec.as_ref(), seq_spec);
        let mut tail = self.tail;
        let (new_seq_root, _) = seq_modifier.modify_btree(self.header.by_seq_root.clone(), seq_actions, &mut tail)?;
        self.tail = tail;

        self.header.by_id_root = new_id_root;
        self.header.by_seq_root = new_seq_root;
        Ok(())
    }

    pub fn save_local_document(&mut self, doc: &LocalDocument) -> Result<()> {
        let value = LocalDocValue { deleted: doc.deleted, body: doc.body.clone() }.encode();
        let action = if doc.deleted {
            Action::Remove(doc.id.clone())
        } else {
            Action::Insert(doc.id.clone(), value)
        };
        let spec = ModifySpec {
            cmp: id_comparator,
            reduce: local_docs_reduce,
            rereduce: local_docs_re_reduce,
            kv_chunk_threshold: self.config.kv_chunk_threshold,
            kp_chunk_threshold: self.config.kp_chunk_threshold,
            compacting: false,
            purge: None,
        };
        let modifier = Modifier::new(&mut self.file, self.codec.as_ref(), spec);
        let mut tail = self.tail;
        let (new_root, _) = modifier.modify_btree(self.header.local_docs_root.clone(), vec![action], &mut tail)?;
        self.tail = tail;
        self.header.local_docs_root = new_root;
        Ok(())
    }

    /// Two-phase header commit: write a same-sized dummy header at the
    /// current tail, sync, then overwrite it with the real header and sync
    /// again. A crash between the two writes leaves the dummy on disk,
    /// which the recovery scan in [`crate::header::find_last_header`]
    /// rejects (its CRC does not cover meaningful root data consistently)
    /// in favor of the previous valid header further back.
    pub fn commit(&mut self) -> Result<()> {
        let commit_pos = self.tail;

        let seq_size = root_encoded_len(&self.header.by_seq_root);
        let id_size = root_encoded_len(&self.header.by_id_root);
        let local_size = root_encoded_len(&self.header.local_docs_root);
        let dummy_len = header::HEADER_BASE_SIZE + seq_size + id_size + local_size;
        let dummy = vec![0u8; dummy_len];

        chunk::write_chunk_at(&mut self.file, commit_pos, &dummy, true)?;
        self.file.sync_all()?;

        let (header_pos, consumed) = chunk::write_chunk_at(&mut self.file, commit_pos, &self.header.encode(), true)?;
        self.header.position = header_pos;
        self.tail = commit_pos + consumed;
        self.file.sync_all()?;
        info!(header_position = header_pos, update_seq = self.header.update_seq, "committed");
        Ok(())
    }

    pub fn database_info(&self) -> DatabaseInfo {
        let mut info = DatabaseInfo {
            file_name: self.path.clone(),
            last_seq: self.header.update_seq,
            document_count: 0,
            deleted_count: 0,
            space_used: 0,
            file_size: self.tail,
            header_position: self.header.position,
        };
        if let Some(root) = &self.header.by_id_root {
            let (live, deleted, size) = crate::reduce::decode_by_id_reduce(&root.reduced_value);
            info.document_count = live;
            info.deleted_count = deleted;
            info.space_used = size + root.subtree_size;
        }
        if let Some(root) = &self.header.by_seq_root {
            info.space_used += root.subtree_size;
        }
        if let Some(root) = &self.header.local_docs_root {
            info.space_used += root.subtree_size;
        }
        info
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn set_header(&mut self, header: Header) {
        self.header = header;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    /// Splits the borrow so a caller can hand a tree walk both the file and
    /// the codec at once — `file_mut()`/`codec()` can't be called together
    /// since one needs `&mut self` and the other `&self`.
    pub fn file_and_codec(&mut self) -> (&mut File, &dyn Codec) {
        (&mut self.file, self.codec.as_ref())
    }

    pub fn set_tail(&mut self, tail: u64) {
        self.tail = tail;
    }

    /// Rewrites this database into `target_path`, dropping superseded
    /// entries and optionally filtering documents via `hook`. See
    /// [`crate::compactor::compact`].
    pub fn compact(
        &mut self,
        target_path: impl AsRef<Path>,
        hook: Option<&mut dyn crate::compactor::CompactHook>,
    ) -> Result<crate::compactor::CompactionStats> {
        crate::compactor::compact(self, target_path, hook)
    }

    /// Pretty-prints whatever is found at a raw file offset — a header, an
    /// interior/leaf node, or a plain data chunk. See [`crate::debug`].
    pub fn debug_address<W: std::io::Write>(
        &mut self,
        out: &mut W,
        offset: u64,
        print_raw: bool,
        allow_large: bool,
        index_hint: crate::debug::IndexTypeHint,
    ) -> Result<()> {
        crate::debug::debug_address(&mut self.file, self.codec.as_ref(), out, offset, print_raw, allow_large, index_hint)
    }
}

fn action_key(a: &Action) -> &[u8] {
    match a {
        Action::Fetch(k) | Action::Remove(k) => k,
        Action::Insert(k, _) => k,
    }
}

fn root_encoded_len(root: &Option<NodePointer>) -> usize {
    match root {
        Some(p) => node::ROOT_BASE_SIZE + p.reduced_value.len(),
        None => 0,
    }
}

//! Background batched writer.
//!
//! The original engine exposes this as a goroutine selecting over three
//! channels (update, commit, quit). Rust's `mpsc` has no multi-channel
//! select, so the three are folded into one channel of an instruction enum
//! and a dedicated thread owns the database for its whole lifetime — the
//! same shape, reached the idiomatic way for this side of the ecosystem.

use std::sync::mpsc;
use std::thread;

use crate::engine::{Document, DocumentInfo, Gouch};
use crate::error::{GouchError, Result};

enum BulkInstr {
    Set(DocumentInfo, Document),
    Delete(DocumentInfo),
}

enum Msg {
    Update(BulkInstr),
    Commit(mpsc::Sender<Result<()>>),
}

/// A handle to a background thread that owns a [`Gouch`] and applies
/// `set`/`delete` calls as one batched `save_documents` + `commit` per
/// `commit()` call, instead of a tree update per document.
pub struct BulkWriter {
    tx: Option<mpsc::Sender<Msg>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BulkWriter {
    pub fn new(db: Gouch) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || run(db, rx));
        BulkWriter { tx: Some(tx), handle: Some(handle) }
    }

    /// Queues a document for the next commit. Does not block on disk I/O.
    pub fn set(&self, info: DocumentInfo, doc: Document) -> Result<()> {
        self.send(Msg::Update(BulkInstr::Set(info, doc)))
    }

    /// Queues a tombstone for the next commit.
    pub fn delete(&self, mut info: DocumentInfo) -> Result<()> {
        info.deleted = true;
        self.send(Msg::Update(BulkInstr::Delete(info)))
    }

    /// Flushes everything queued so far in one tree update and fsyncs the
    /// header. Blocks until the background thread replies.
    pub fn commit(&self) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Msg::Commit(reply_tx))?;
        reply_rx.recv().map_err(|_| closed_err())?
    }

    fn send(&self, msg: Msg) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(closed_err)?;
        tx.send(msg).map_err(|_| closed_err())
    }

    /// Stops accepting new work and waits for the background thread to
    /// exit. Any batch queued but not yet committed is dropped.
    pub fn close(mut self) -> Result<()> {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| GouchError::Corrupt("bulk writer thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for BulkWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn closed_err() -> GouchError {
    GouchError::Corrupt("bulk writer is closed".into())
}

fn run(mut db: Gouch, rx: mpsc::Receiver<Msg>) {
    let mut batch: Vec<BulkInstr> = Vec::with_capacity(100);
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Update(instr) => batch.push(instr),
            Msg::Commit(reply) => {
                let result = commit_batch(&mut db, &mut batch);
                let _ = reply.send(result);
            }
        }
    }
}

fn commit_batch(db: &mut Gouch, batch: &mut Vec<BulkInstr>) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut infos: Vec<DocumentInfo> = Vec::with_capacity(batch.len());
    let mut owned_docs: Vec<Option<Document>> = Vec::with_capacity(batch.len());
    for instr in batch.drain(..) {
        match instr {
            BulkInstr::Set(info, doc) => {
                infos.push(info);
                owned_docs.push(Some(doc));
            }
            BulkInstr::Delete(info) => {
                infos.push(info);
                owned_docs.push(None);
            }
        }
    }
    let docs: Vec<Option<&Document>> = owned_docs.iter().map(|d| d.as_ref()).collect();
    db.save_documents(&docs, &mut infos)?;
    db.commit()
}

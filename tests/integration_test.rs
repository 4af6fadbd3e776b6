use gouch::{Document, DocumentInfo, EngineConfig, Gouch};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use tempfile::tempdir;

#[test]
fn fresh_database_starts_with_an_empty_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.couch");
    let db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
    let info = db.database_info();
    assert_eq!(info.last_seq, 0);
    assert_eq!(info.document_count, 0);
    assert!(db.tail() > 0);
}

#[test]
fn save_then_reopen_round_trips_document_body() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("roundtrip.couch");

    {
        let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
        let doc = Document { id: b"article/1".to_vec(), body: b"the quick brown fox".to_vec() };
        let mut info = DocumentInfo::new(doc.id.clone());
        db.save_document(Some(&doc), &mut info).unwrap();
        db.commit().unwrap();
    }

    let mut reopened = Gouch::open(&path, false, EngineConfig::default()).unwrap();
    let doc = reopened.document_by_id(b"article/1").unwrap();
    assert_eq!(doc.body, b"the quick brown fox");
    assert_eq!(reopened.database_info().last_seq, 1);
}

#[test]
fn batched_thousand_document_commit_is_fully_visible() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("batched.couch");
    let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();

    let docs: Vec<Document> = (0..1000)
        .map(|i| Document { id: format!("doc-{i:04}").into_bytes(), body: format!("body-{i}").into_bytes() })
        .collect();
    let doc_refs: Vec<Option<&Document>> = docs.iter().map(Some).collect();
    let mut infos: Vec<DocumentInfo> = docs.iter().map(|d| DocumentInfo::new(d.id.clone())).collect();

    db.save_documents(&doc_refs, &mut infos).unwrap();
    db.commit().unwrap();

    let info = db.database_info();
    assert_eq!(info.document_count, 1000);
    assert_eq!(info.last_seq, 1000);

    let ids: Vec<Vec<u8>> = db.all_documents(None, None).unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(ids.len(), 1000);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    for i in [0, 499, 999] {
        let id = format!("doc-{i:04}");
        let body = db.document_body_by_id(id.as_bytes()).unwrap();
        assert_eq!(body, format!("body-{i}").into_bytes());
    }
}

#[test]
fn uncommitted_writes_are_invisible_after_crash_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial.couch");

    {
        let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
        let first = Document { id: b"kept".to_vec(), body: b"survives".to_vec() };
        let mut first_info = DocumentInfo::new(first.id.clone());
        db.save_document(Some(&first), &mut first_info).unwrap();
        db.commit().unwrap();

        // Appends a second document's body and index update but never calls
        // commit(), leaving only the dummy-or-nothing tail past the last
        // valid header.
        let second = Document { id: b"lost".to_vec(), body: b"never committed".to_vec() };
        let mut second_info = DocumentInfo::new(second.id.clone());
        db.save_document(Some(&second), &mut second_info).unwrap();
    }

    let mut reopened = Gouch::open(&path, false, EngineConfig::default()).unwrap();
    assert_eq!(reopened.document_body_by_id(b"kept").unwrap(), b"survives");
    assert!(reopened.document_info_by_id(b"lost").is_err());
    assert_eq!(reopened.database_info().last_seq, 1);
}

#[test]
fn reopen_recovers_from_a_truncated_trailing_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("truncated.couch");

    let good_tail = {
        let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
        let doc = Document { id: b"stable".to_vec(), body: b"good header".to_vec() };
        let mut info = DocumentInfo::new(doc.id.clone());
        db.save_document(Some(&doc), &mut info).unwrap();
        db.commit().unwrap();
        db.tail()
    };

    {
        let mut db = Gouch::open(&path, false, EngineConfig::default()).unwrap();
        let doc = Document { id: b"half-written".to_vec(), body: b"x".repeat(5000) };
        let mut info = DocumentInfo::new(doc.id.clone());
        db.save_document(Some(&doc), &mut info).unwrap();
        db.commit().unwrap();
    }

    // Simulates a crash partway through flushing the second commit's header
    // by chopping the file back to just past the first, valid header.
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(good_tail + 10).unwrap();
    drop(file);

    let mut recovered = Gouch::open(&path, false, EngineConfig::default()).unwrap();
    assert_eq!(recovered.document_body_by_id(b"stable").unwrap(), b"good header");
    assert!(recovered.document_info_by_id(b"half-written").is_err());
    assert_eq!(recovered.database_info().last_seq, 1);
}

#[test]
fn compaction_preserves_live_documents_and_drops_tombstones() {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("source.couch");
    let target_path = dir.path().join("compacted.couch");

    let mut db = Gouch::open(&source_path, true, EngineConfig::default()).unwrap();
    for i in 0..20 {
        let doc = Document { id: format!("rec-{i}").into_bytes(), body: format!("payload-{i}").into_bytes() };
        let mut info = DocumentInfo::new(doc.id.clone());
        db.save_document(Some(&doc), &mut info).unwrap();
    }
    db.commit().unwrap();

    {
        let mut info = db.document_info_by_id(b"rec-3").unwrap();
        db.save_document(None, &mut info).unwrap();
        db.commit().unwrap();
    }

    let stats = db.compact(&target_path, None).unwrap();
    assert_eq!(stats.documents_copied, 20);

    let mut compacted = Gouch::open(&target_path, false, EngineConfig::default()).unwrap();
    for i in 0..20 {
        let id = format!("rec-{i}");
        let body = compacted.document_body_by_id(id.as_bytes()).unwrap();
        assert_eq!(body, format!("payload-{i}").into_bytes());
    }
    let tombstone = compacted.document_info_by_id(b"rec-3").unwrap();
    assert!(tombstone.deleted);
}

#[test]
fn local_documents_survive_reopen_and_are_excluded_from_changes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("local.couch");

    {
        let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
        let doc = Document { id: b"tracked".to_vec(), body: b"v".to_vec() };
        let mut info = DocumentInfo::new(doc.id.clone());
        db.save_document(Some(&doc), &mut info).unwrap();

        let local = gouch::LocalDocument { id: b"_local/checkpoint".to_vec(), body: b"{\"seq\":1}".to_vec(), deleted: false };
        db.save_local_document(&local).unwrap();
        db.commit().unwrap();
    }

    let mut reopened = Gouch::open(&path, false, EngineConfig::default()).unwrap();
    let local = reopened.local_document_by_id(b"_local/checkpoint").unwrap();
    assert_eq!(local.body, b"{\"seq\":1}");

    let changed: Vec<Vec<u8>> = reopened
        .changes_since(0, 0)
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert!(!changed.iter().any(|key| key.len() != 6));
}

#[test]
fn debug_address_reports_the_last_header_position() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("debug.couch");
    let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
    let doc = Document { id: b"x".to_vec(), body: b"y".to_vec() };
    let mut info = DocumentInfo::new(doc.id.clone());
    db.save_document(Some(&doc), &mut info).unwrap();
    db.commit().unwrap();

    let mut out = Vec::new();
    let position = db.header().position;
    db.debug_address(&mut out, position, false, false, gouch::IndexTypeHint::Guess).unwrap();
    let rendered = String::from_utf8(out).unwrap();
    assert!(rendered.to_lowercase().contains("header"));
}

#[test]
fn bulk_writer_commits_a_batch_in_one_pass() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bulk.couch");
    let db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
    let bulk = gouch::BulkWriter::new(db);

    for i in 0..50 {
        let doc = Document { id: format!("b{i}").into_bytes(), body: format!("v{i}").into_bytes() };
        let info = DocumentInfo::new(doc.id.clone());
        bulk.set(info, doc).unwrap();
    }
    bulk.commit().unwrap();
    bulk.close().unwrap();

    let mut reopened = Gouch::open(&path, false, EngineConfig::default()).unwrap();
    assert_eq!(reopened.database_info().document_count, 50);
}

#[test]
fn repeated_updates_keep_by_id_reduce_in_sync_with_a_full_walk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("revisions.couch");
    let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();

    let num_docs = 200;
    let revisions_per_doc = 5;
    for rev in 1..=revisions_per_doc {
        for i in 0..num_docs {
            let id = format!("doc-{i}");
            let doc = Document { id: id.clone().into_bytes(), body: format!("rev{rev}-{i}").into_bytes() };
            let mut info = if rev == 1 {
                DocumentInfo::new(doc.id.clone())
            } else {
                db.document_info_by_id(id.as_bytes()).unwrap()
            };
            info.rev = rev as u64;
            db.save_document(Some(&doc), &mut info).unwrap();
        }
        if rev % 2 == 0 {
            db.commit().unwrap();
        }
    }
    db.commit().unwrap();

    let info = db.database_info();
    assert_eq!(info.document_count, num_docs as u64);
    assert_eq!(info.deleted_count, 0);

    let walked: Vec<Vec<u8>> = db.all_documents(None, None).unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(walked.len(), num_docs);

    for i in 0..num_docs {
        let id = format!("doc-{i}");
        let info = db.document_info_by_id(id.as_bytes()).unwrap();
        assert_eq!(info.rev, revisions_per_doc as u64);
        let body = db.document_body_by_id(id.as_bytes()).unwrap();
        assert_eq!(body, format!("rev{revisions_per_doc}-{i}").into_bytes());
    }
}

#[test]
fn compressed_document_round_trips_through_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("compressed.couch");

    {
        let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
        let doc = Document { id: b"newdoc".to_vec(), body: br#"{"abc":123}"#.to_vec() };
        let mut info = DocumentInfo::new(doc.id.clone());
        info.rev = 7;
        info.content_meta = gouch::engine::DOC_IS_COMPRESSED;
        db.save_document(Some(&doc), &mut info).unwrap();
        db.commit().unwrap();
    }

    let mut reopened = Gouch::open(&path, false, EngineConfig::default()).unwrap();
    let info = reopened.document_info_by_id(b"newdoc").unwrap();
    assert_eq!(info.rev, 7);
    assert!(info.is_compressed());
    let doc = reopened.document_by_document_info(&info).unwrap();
    assert_eq!(doc.body, br#"{"abc":123}"#);
}

#[test]
fn file_grows_monotonically_with_each_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("growth.couch");
    let mut db = Gouch::open(&path, true, EngineConfig::default()).unwrap();
    let tail_after_open = db.tail();

    let doc = Document { id: b"g".to_vec(), body: b"grow".to_vec() };
    let mut info = DocumentInfo::new(doc.id.clone());
    db.save_document(Some(&doc), &mut info).unwrap();
    db.commit().unwrap();

    assert!(db.tail() > tail_after_open);

    let mut f = OpenOptions::new().read(true).open(&path).unwrap();
    let len = f.seek(SeekFrom::End(0)).unwrap();
    assert_eq!(len, db.tail());
    let mut buf = Vec::new();
    f.rewind().unwrap();
    f.read_to_end(&mut buf).unwrap();
    assert_eq!(buf.len() as u64, len);
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;

use gouch::{CompactAction, CompactHook, DocumentInfo, EngineConfig, Gouch, IndexTypeHint};

#[derive(Parser)]
#[command(name = "gouch", version, about = "A couchstore-compatible embedded document store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a database and run a simulated workload against it
    Create {
        path: PathBuf,
        /// Number of save operations to simulate
        #[arg(long, default_value = "1000")]
        num_ops: usize,
        /// Commit every N operations
        #[arg(long, default_value = "100")]
        commit_every: usize,
    },
    /// Fetch one document by id
    Get {
        path: PathBuf,
        id: String,
        /// Only print the document info, not the body
        #[arg(long)]
        info_only: bool,
        /// Only print the document body, not the info
        #[arg(long)]
        body_only: bool,
    },
    /// List documents in id or sequence order
    List {
        path: PathBuf,
        #[arg(long)]
        start_id: Option<String>,
        #[arg(long)]
        end_id: Option<String>,
        #[arg(long)]
        start_seq: Option<u64>,
        #[arg(long)]
        end_seq: Option<u64>,
    },
    /// Compact a database into a fresh file
    Compact {
        path: PathBuf,
        target: PathBuf,
        /// Drop documents instead of carrying them into the compacted file
        #[arg(long)]
        drop_deleted: bool,
    },
    /// Print database info, or inspect a raw file offset
    Debug {
        path: PathBuf,
        /// Raw byte offset to inspect; omit to print the last header position
        offset: Option<String>,
        #[arg(long)]
        print_raw: bool,
        #[arg(long)]
        allow_large: bool,
        /// Index type for leaf decoding: guess (default), id, seq, local
        #[arg(long, default_value = "guess")]
        index_type: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Commands::Create { path, num_ops, commit_every } => cmd_create(&path, num_ops, commit_every)?,
        Commands::Get { path, id, info_only, body_only } => cmd_get(&path, &id, info_only, body_only)?,
        Commands::List { path, start_id, end_id, start_seq, end_seq } => {
            cmd_list(&path, start_id, end_id, start_seq, end_seq)?
        }
        Commands::Compact { path, target, drop_deleted } => cmd_compact(&path, &target, drop_deleted)?,
        Commands::Debug { path, offset, print_raw, allow_large, index_type } => {
            cmd_debug(&path, offset, print_raw, allow_large, &index_type)?
        }
    }

    Ok(())
}

fn cmd_create(path: &PathBuf, num_ops: usize, commit_every: usize) -> gouch::Result<()> {
    let mut db = Gouch::open(path, true, EngineConfig::default())?;
    let mut next_doc_id = 0usize;
    let mut live_ids: Vec<String> = Vec::new();

    for i in 0..num_ops {
        let roll = pseudo_random(i) % 100;
        if roll < 70 || live_ids.is_empty() {
            let id = format!("doc-{next_doc_id}");
            next_doc_id += 1;
            let doc = gouch::Document { id: id.clone().into_bytes(), body: sample_body(i) };
            let mut info = DocumentInfo::new(doc.id.clone());
            db.save_document(Some(&doc), &mut info)?;
            live_ids.push(id);
        } else if roll < 90 {
            let idx = pseudo_random(i + 1) as usize % live_ids.len();
            let id = live_ids[idx].clone();
            let doc = gouch::Document { id: id.clone().into_bytes(), body: sample_body(i) };
            let mut info = db.document_info_by_id(id.as_bytes())?;
            info.rev += 1;
            db.save_document(Some(&doc), &mut info)?;
        } else {
            let idx = pseudo_random(i + 2) as usize % live_ids.len();
            let id = live_ids.remove(idx);
            let mut info = db.document_info_by_id(id.as_bytes())?;
            db.save_document(None, &mut info)?;
        }

        if i % commit_every == 0 {
            db.commit()?;
        }
    }
    db.commit()?;

    let info = db.database_info();
    println!("created {} with {} live documents ({} deleted)", path.display(), info.document_count, info.deleted_count);
    Ok(())
}

fn sample_body(i: usize) -> Vec<u8> {
    format!(r#"{{"content":{i},"filler":"sample document body for operation {i}"}}"#).into_bytes()
}

/// A small deterministic PRNG so `create` runs reproducibly without pulling
/// in a dependency just to pick random operations.
fn pseudo_random(seed: usize) -> u64 {
    let mut x = seed as u64 ^ 0x9E3779B97F4A7C15;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x
}

fn cmd_get(path: &PathBuf, id: &str, info_only: bool, body_only: bool) -> gouch::Result<()> {
    let print_info = !body_only;
    let print_body = !info_only;

    let mut db = Gouch::open(path, false, EngineConfig::default())?;
    let info = db.document_info_by_id(id.as_bytes())?;

    if print_info {
        if print_body {
            println!("Document Info:");
        }
        println!("{}", serde_json::to_string_pretty(&document_info_json(&info))?);
    }

    let doc = db.document_by_document_info(&info)?;
    if print_body {
        if print_info {
            println!("Document Body:");
        }
        println!("{}", String::from_utf8_lossy(&doc.body));
    }
    Ok(())
}

fn document_info_json(info: &DocumentInfo) -> serde_json::Value {
    json!({
        "id": String::from_utf8_lossy(&info.id),
        "seq": info.seq,
        "rev": info.rev,
        "contentMeta": info.content_meta,
        "deleted": info.deleted,
        "size": info.size,
        "bodyPosition": info.body_position,
    })
}

fn cmd_list(
    path: &PathBuf,
    start_id: Option<String>,
    end_id: Option<String>,
    start_seq: Option<u64>,
    end_seq: Option<u64>,
) -> gouch::Result<()> {
    let mut db = Gouch::open(path, false, EngineConfig::default())?;
    let mut count = 0usize;

    if start_seq.is_some() || end_seq.is_some() {
        let since = start_seq.unwrap_or(0);
        let till = end_seq.unwrap_or(0);
        for item in db.changes_since(since, till)? {
            let (seq_key, raw) = item?;
            let info = decode_seq_entry(&seq_key, &raw);
            println!("{}", serde_json::to_string_pretty(&document_info_json(&info))?);
            count += 1;
        }
    } else {
        let start = start_id.as_deref().map(|s| s.as_bytes().to_vec());
        let end = end_id.as_deref().map(|s| s.as_bytes().to_vec());
        for item in db.all_documents(start.as_deref(), end.as_deref())? {
            let (id, raw) = item?;
            let v = gouch::node::ByIdValue::decode(&raw);
            let info = DocumentInfo {
                id,
                seq: v.seq,
                rev: v.rev,
                rev_meta: v.rev_meta,
                content_meta: v.content_meta,
                deleted: v.deleted,
                size: v.size,
                body_position: v.body_offset,
            };
            println!("{}", serde_json::to_string_pretty(&document_info_json(&info))?);
            count += 1;
        }
    }

    println!("Listed {count} documents");
    Ok(())
}

fn decode_seq_entry(seq_key: &[u8], raw: &[u8]) -> DocumentInfo {
    let v = gouch::node::BySeqValue::decode(raw);
    DocumentInfo {
        id: v.id,
        seq: gouch::raw::decode_raw48(seq_key),
        rev: v.rev,
        rev_meta: v.rev_meta,
        content_meta: v.content_meta,
        deleted: v.deleted,
        size: v.size,
        body_position: v.body_offset,
    }
}

struct DropDeletedHook;
impl CompactHook for DropDeletedHook {
    fn decide(&mut self, info: &DocumentInfo) -> CompactAction {
        if info.deleted {
            CompactAction::Drop
        } else {
            CompactAction::Keep
        }
    }
}

fn cmd_compact(path: &PathBuf, target: &PathBuf, drop_deleted: bool) -> gouch::Result<()> {
    let mut db = Gouch::open(path, false, EngineConfig::default())?;
    let stats = if drop_deleted {
        let mut hook = DropDeletedHook;
        db.compact(target, Some(&mut hook))?
    } else {
        db.compact(target, None)?
    };
    println!(
        "compacted {} -> {} ({} documents copied, {} dropped, {} local docs copied)",
        path.display(),
        target.display(),
        stats.documents_copied,
        stats.documents_dropped,
        stats.local_docs_copied,
    );
    Ok(())
}

fn cmd_debug(path: &PathBuf, offset: Option<String>, print_raw: bool, allow_large: bool, index_type: &str) -> gouch::Result<()> {
    let mut db = Gouch::open(path, false, EngineConfig::default())?;

    let Some(offset) = offset else {
        let info = db.database_info();
        println!("Last valid header found at: {:#x}", info.header_position);
        return Ok(());
    };

    let offset = parse_offset(&offset)?;
    let hint = match index_type {
        "id" => IndexTypeHint::ById,
        "seq" => IndexTypeHint::BySeq,
        "local" => IndexTypeHint::LocalDocs,
        _ => IndexTypeHint::Guess,
    };

    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    db.debug_address(&mut lock, offset, print_raw, allow_large, hint)
}

fn parse_offset(s: &str) -> gouch::Result<u64> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|e| gouch::GouchError::InvalidArguments(format!("bad offset {s}: {e}")))
}

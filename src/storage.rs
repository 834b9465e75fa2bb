//! # Durable Table Storage
//!
//! A table marked `durable` writes every membership change through to an
//! append-only log of crc-framed records, with a JSON metadata sidecar
//! describing the schema the log was written under. Opening the store
//! replays the log into the in-memory image that scans read through, so a
//! write is visible to every subsequent read on the router thread.

use crate::catalog::TableDef;
use crate::table::{MemStore, Polarity, TupleStore};
use crate::tuple::Tuple;
use crate::value::Datum;
use crate::wire::{self, FrameReadError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Durable store errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("log for table '{table}' was written under a different schema: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("corrupt log record: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Schema fingerprint stored next to the log.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct TableMeta {
    name: String,
    columns: Vec<String>,
    key: Vec<usize>,
    loc_col: Option<usize>,
}

impl TableMeta {
    fn of(def: &TableDef) -> TableMeta {
        TableMeta {
            name: def.name.clone(),
            columns: def.schema.types().iter().map(|t| t.as_str().to_string()).collect(),
            key: def.schema.key_columns().to_vec(),
            loc_col: def.schema.loc_column(),
        }
    }
}

/// Write-through membership store backed by an append-only log.
#[derive(Debug)]
pub struct DurableStore {
    name: String,
    mem: MemStore,
    log: BufWriter<File>,
}

impl DurableStore {
    /// Open (creating if absent) the store for `def` under `base_dir`.
    /// Returns the store plus the member rows recovered from the log; the
    /// caller seeds its accounting from them.
    pub fn open(def: &TableDef, base_dir: &Path) -> StorageResult<(DurableStore, Vec<Vec<Datum>>)> {
        fs::create_dir_all(base_dir)?;
        let log_path = base_dir.join(format!("{}.log", def.name));
        let meta_path = base_dir.join(format!("{}.meta.json", def.name));

        check_meta(def, &meta_path)?;

        let rows = if log_path.exists() { replay(&def.name, def, &log_path)? } else { Vec::new() };

        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let store = DurableStore {
            name: def.name.clone(),
            mem: MemStore::new(),
            log: BufWriter::new(file),
        };
        Ok((store, rows))
    }

    fn append(&mut self, polarity: Polarity, t: &Tuple) -> StorageResult<()> {
        let body = wire::encode_fact(&self.name, polarity, &t.values());
        self.log.write_all(&wire::frame(&body))?;
        self.log.flush()?;
        Ok(())
    }
}

impl TupleStore for DurableStore {
    fn insert(&mut self, t: Tuple) -> StorageResult<()> {
        self.append(Polarity::Insert, &t)?;
        self.mem.insert(t)
    }

    fn remove(&mut self, t: &Tuple) -> StorageResult<()> {
        self.append(Polarity::Delete, t)?;
        self.mem.remove(t)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Tuple> + '_> {
        self.mem.iter()
    }

    fn len(&self) -> usize {
        self.mem.len()
    }
}

/// Verify the sidecar matches the current define, writing it on first open.
fn check_meta(def: &TableDef, meta_path: &Path) -> StorageResult<()> {
    let meta = TableMeta::of(def);
    if meta_path.exists() {
        let existing: TableMeta = serde_json::from_reader(File::open(meta_path)?)?;
        if existing != meta {
            return Err(StorageError::SchemaMismatch {
                table: def.name.clone(),
                detail: format!("expected {meta:?}, found {existing:?}"),
            });
        }
    } else {
        let file = File::create(meta_path)?;
        serde_json::to_writer_pretty(file, &meta)?;
    }
    Ok(())
}

/// Replay the log into the surviving member rows, keyed by key columns. A
/// torn or corrupt tail is truncated away with a warning; everything before
/// it is kept.
fn replay(name: &str, def: &TableDef, log_path: &Path) -> StorageResult<Vec<Vec<Datum>>> {
    let key_cols = def.schema.key_columns();
    let mut members: HashMap<Vec<Datum>, Vec<Datum>> = HashMap::new();
    let mut good_offset: u64 = 0;

    let file = File::open(log_path)?;
    let mut reader = BufReader::new(file);
    loop {
        match wire::read_frame(&mut reader) {
            Ok(Some(body)) => {
                let fact = wire::decode_fact(&body)
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                if fact.table != name {
                    return Err(StorageError::Corrupt(format!(
                        "record for table '{}' in log of '{name}'",
                        fact.table
                    )));
                }
                let key: Vec<Datum> =
                    key_cols.iter().filter_map(|&i| fact.values.get(i).cloned()).collect();
                match fact.polarity {
                    Polarity::Insert => {
                        members.entry(key).or_insert(fact.values);
                    }
                    Polarity::Delete => {
                        members.remove(&key);
                    }
                }
                good_offset += 8 + body.len() as u64;
            }
            Ok(None) => break,
            Err(FrameReadError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!(table = name, offset = good_offset, "torn log tail truncated");
                OpenOptions::new().write(true).open(log_path)?.set_len(good_offset)?;
                break;
            }
            Err(e) => {
                tracing::warn!(table = name, offset = good_offset, error = %e,
                    "corrupt log tail truncated");
                OpenOptions::new().write(true).open(log_path)?.set_len(good_offset)?;
                break;
            }
        }
    }

    Ok(members.into_values().collect())
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Column store.
//!
//! # Guarantees
//! - `write` is atomic: readers observe all of a batch or none of it.
//! - With a data directory, a batch is durable in the log before it becomes
//!   visible, and `open` rebuilds the columns by replaying the log.
//! - A torn final record (crash mid-append) is truncated on open; a checksum
//!   failure anywhere is an error.

use crate::batch::{Batch, Op};
use crate::column::{self, Column};
use crate::error::{PersistenceError, Result};
use crate::wal;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const WAL_FILE: &str = "events.wal";

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

pub struct Store {
    columns: RwLock<Vec<ColumnMap>>,
    /// Serializes writers; holds the log file when the store is durable.
    log: Mutex<Option<File>>,
    path: Option<PathBuf>,
    batches: AtomicU64,
}

impl Store {
    /// Volatile store; nothing survives the process.
    pub fn memory() -> Self {
        Self {
            columns: RwLock::new(vec![ColumnMap::new(); Column::COUNT]),
            log: Mutex::new(None),
            path: None,
            batches: AtomicU64::new(0),
        }
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE);

        let mut columns = vec![ColumnMap::new(); Column::COUNT];
        let mut batches = 0u64;

        if path.exists() {
            let mut reader = wal::read_stream(&path)?;
            let mut torn = false;
            for record in reader.by_ref() {
                let record = match record {
                    Ok(r) => r,
                    Err(PersistenceError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        torn = true;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                if record.header.batch != batches + 1 {
                    return Err(PersistenceError::OutOfOrder {
                        expected: batches + 1,
                        found: record.header.batch,
                    });
                }
                for op in record.ops()? {
                    apply(&mut columns, op);
                }
                batches = record.header.batch;
            }
            if torn {
                let good = reader.offset();
                OpenOptions::new().write(true).open(&path)?.set_len(good)?;
            }
        }

        let file = wal::open_append(&path)?;
        Ok(Self {
            columns: RwLock::new(columns),
            log: Mutex::new(Some(file)),
            path: Some(path),
            batches: AtomicU64::new(batches),
        })
    }

    /// Commit a batch atomically. Returns its batch number.
    pub fn write(&self, batch: Batch) -> Result<u64> {
        let mut log = self.log.lock();
        let number = self.batches.load(Ordering::Acquire) + 1;

        let ops = batch.into_ops();
        if let Some(file) = log.as_mut() {
            let payload = wal::encode_ops(&ops)?;
            wal::append_batch(file, number, &payload)?;
        }

        let mut columns = self.columns.write();
        for op in ops {
            apply(&mut columns, op);
        }
        self.batches.store(number, Ordering::Release);

        Ok(number)
    }

    pub fn get(&self, column: Column, key: &[u8]) -> Option<Vec<u8>> {
        self.columns.read()[column as usize].get(key).cloned()
    }

    pub fn contains(&self, column: Column, key: &[u8]) -> bool {
        self.columns.read()[column as usize].contains_key(key)
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn prefix(&self, column: Column, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let columns = self.columns.read();
        columns[column as usize]
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Greatest key under `prefix`.
    pub fn last(&self, column: Column, prefix: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let columns = self.columns.read();
        columns[column as usize]
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .last()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn len(&self, column: Column) -> usize {
        self.columns.read()[column as usize].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len(Column::EventIdx) == 0
    }

    /// Highest event index written; zero for an empty store.
    pub fn last_sequence(&self) -> u64 {
        let columns = self.columns.read();
        columns[Column::EventJson as usize]
            .keys()
            .next_back()
            .and_then(|k| column::read_u64(k))
            .unwrap_or(0)
    }

    /// Number of batches committed since the log began.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Acquire)
    }

    pub fn wal_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn apply(columns: &mut [ColumnMap], op: Op) {
    match op {
        Op::Set { column, key, value } => {
            columns[column as usize].insert(key, value);
        }
        Op::Delete { column, key } => {
            columns[column as usize].remove(&key);
        }
    }
}

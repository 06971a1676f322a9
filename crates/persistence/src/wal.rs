// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Checksummed write-ahead log of committed batches.
//!
//! Each record is a fixed header followed by the bincode encoding of the
//! batch's operations:
//!
//! ```text
//! | batch u64 LE | payload_len u32 LE | crc64 u64 LE | payload ... |
//! ```
//!
//! # Invariants
//! - Batch numbers are strictly increasing by one.
//! - The checksum covers the batch number, the length and the payload.
//! - A record is durable once `append_batch` returns (`sync_data`).

use crate::batch::Op;
use crate::error::{PersistenceError, Result};
use crc64fast::Digest;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalBatchHeader {
    pub batch: u64,
    pub payload_len: u32,
    pub checksum: u64,
}

impl WalBatchHeader {
    pub const SIZE: usize = 8 + 4 + 8;

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf)?;

        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[0..8]);
        let batch = u64::from_le_bytes(word);
        let mut half = [0u8; 4];
        half.copy_from_slice(&buf[8..12]);
        let payload_len = u32::from_le_bytes(half);
        word.copy_from_slice(&buf[12..20]);
        let checksum = u64::from_le_bytes(word);

        Ok(Self {
            batch,
            payload_len,
            checksum,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.batch.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[12..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }
}

pub struct WalRecord {
    pub header: WalBatchHeader,
    pub payload: Vec<u8>,
}

impl WalRecord {
    pub fn ops(&self) -> Result<Vec<Op>> {
        decode_ops(&self.payload)
    }
}

fn checksum(batch: u64, payload: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(&batch.to_le_bytes());
    digest.write(&(payload.len() as u32).to_le_bytes());
    digest.write(payload);
    digest.sum64()
}

pub fn encode_ops(ops: &[Op]) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(ops, bincode::config::standard())
        .map_err(|e| PersistenceError::InvalidFormat(e.to_string()))
}

pub fn decode_ops(payload: &[u8]) -> Result<Vec<Op>> {
    bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map(|(ops, _)| ops)
        .map_err(|e| PersistenceError::InvalidFormat(e.to_string()))
}

pub fn open_append(path: impl AsRef<Path>) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

pub fn append_batch(file: &mut File, batch: u64, payload: &[u8]) -> Result<()> {
    let header = WalBatchHeader {
        batch,
        payload_len: payload.len() as u32,
        checksum: checksum(batch, payload),
    };

    file.write_all(&header.to_bytes())?;
    file.write_all(payload)?;
    file.sync_data()?;

    Ok(())
}

pub struct WalReader {
    reader: BufReader<File>,
    offset: u64,
}

impl WalReader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// Byte offset just past the last complete record returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Iterator for WalReader {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.fill_buf() {
            Ok([]) => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(PersistenceError::IoError(e))),
        }

        // A partial header or payload surfaces as UnexpectedEof: a torn tail.
        let header = match WalBatchHeader::read_from(&mut self.reader) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };

        let mut payload = vec![0u8; header.payload_len as usize];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            return Some(Err(PersistenceError::IoError(e)));
        }

        let found = checksum(header.batch, &payload);
        if found != header.checksum {
            return Some(Err(PersistenceError::ChecksumMismatch {
                batch: header.batch,
                expected: header.checksum,
                found,
            }));
        }

        self.offset += (WalBatchHeader::SIZE + payload.len()) as u64;
        Some(Ok(WalRecord { header, payload }))
    }
}

pub fn read_stream(path: impl AsRef<Path>) -> Result<WalReader> {
    WalReader::new(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use tempfile::tempdir;

    #[test]
    fn test_wal_header_serialization() {
        let header = WalBatchHeader {
            batch: 7,
            payload_len: 11,
            checksum: checksum(7, b"hello world"),
        };

        let bytes = header.to_bytes();
        let mut reader = &bytes[..];
        let decoded = WalBatchHeader::read_from(&mut reader).unwrap();

        assert_eq!(header, decoded);
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.wal");
        let mut file = open_append(&path).unwrap();

        let ops = vec![Op::Set {
            column: Column::EventIdx,
            key: b"$a".to_vec(),
            value: vec![0, 0, 0, 0, 0, 0, 0, 1],
        }];
        append_batch(&mut file, 1, &encode_ops(&ops).unwrap()).unwrap();
        append_batch(&mut file, 2, &encode_ops(&[]).unwrap()).unwrap();

        let records: Vec<_> = read_stream(&path).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].header.batch, 1);
        assert_eq!(records[0].ops().unwrap(), ops);
        assert!(records[1].ops().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.wal");
        let mut file = open_append(&path).unwrap();
        append_batch(&mut file, 1, b"payload").unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let first = read_stream(&path).unwrap().next().unwrap();
        assert!(matches!(first, Err(PersistenceError::ChecksumMismatch { batch: 1, .. })));
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use hsvm_kernel::KernelError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Checksum mismatch in batch {batch}: expected {expected:016x}, found {found:016x}")]
    ChecksumMismatch {
        batch: u64,
        expected: u64,
        found: u64,
    },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid data format: {0}")]
    InvalidFormat(String),
    #[error("Batch {found} out of order after {expected}")]
    OutOfOrder { expected: u64, found: u64 },
    #[error("Stored event is malformed: {0}")]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Write-ahead batch.
//!
//! A `Batch` accumulates column mutations in order. Nothing is visible to
//! readers until the whole batch is handed to `Store::write`.

use crate::column::Column;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Set {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

impl Op {
    pub fn column(&self) -> Column {
        match self {
            Op::Set { column, .. } | Op::Delete { column, .. } => *column,
        }
    }

    fn weight(&self) -> usize {
        match self {
            Op::Set { key, value, .. } => key.len() + value.len() + 1,
            Op::Delete { key, .. } => key.len() + 1,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Batch {
    ops: Vec<Op>,
    bytes: usize,
    reserved: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch sized for roughly `bytes` of keys and values.
    pub fn with_reserve(bytes: usize) -> Self {
        Self {
            ops: Vec::with_capacity(bytes / 64 + 1),
            bytes: 0,
            reserved: bytes,
        }
    }

    pub fn set(&mut self, column: Column, key: Vec<u8>, value: Vec<u8>) {
        self.push(Op::Set { column, key, value });
    }

    pub fn delete(&mut self, column: Column, key: Vec<u8>) {
        self.push(Op::Delete { column, key });
    }

    pub fn push(&mut self, op: Op) {
        self.bytes += op.weight();
        self.ops.push(op);
    }

    /// Number of staged mutations.
    pub fn size(&self) -> usize {
        self.ops.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Write transactions.
//!
//! A transaction is opened at COMMIT by the unit that owns it and shared,
//! through the evaluation tree, with nested evaluations started while it is
//! open. Everything staged into it becomes durable in one batch when the
//! owner reaches WRITE.

use super::opts::Opts;
use super::registry::EvalId;
use crate::storage::Storage;
use hsvm_kernel::Event;
use hsvm_persistence::{Batch, WriteOpts};
use parking_lot::Mutex;

/// Reservation for an event's batch: its serialized size scaled for index
/// overhead, plus a fixed allowance.
pub fn calc_reserve(opts: &Opts, event: &Event) -> usize {
    let base = opts
        .reserve_bytes
        .unwrap_or_else(|| (event.serialized_len() as f64 * 1.66) as usize);
    base + opts.reserve_index
}

/// An accepted event awaiting delivery to local clients and remote servers.
#[derive(Clone, Debug)]
pub struct Notice {
    pub event: Event,
    pub clients: bool,
    pub servers: bool,
    /// Echoed to clients as `unsigned.transaction_id`.
    pub client_txnid: Option<String>,
}

#[derive(Debug)]
pub struct Txn {
    pub owner: EvalId,
    pub owner_seq: u64,
    batch: Mutex<Batch>,
    staged: Mutex<usize>,
    deferred: Mutex<Vec<Notice>>,
}

impl Txn {
    pub fn new(owner: EvalId, owner_seq: u64, reserve: usize) -> Self {
        Self {
            owner,
            owner_seq,
            batch: Mutex::new(Batch::with_reserve(reserve)),
            staged: Mutex::new(0),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Stage the index mutations for `event`. Returns the number staged.
    pub fn append(&self, store: &dyn Storage, event: &Event, wopts: &WriteOpts) -> usize {
        let mut batch = self.batch.lock();
        let n = store.index(&mut batch, event, wopts);
        *self.staged.lock() += 1;
        n
    }

    /// Events staged so far.
    pub fn events(&self) -> usize {
        *self.staged.lock()
    }

    pub fn size(&self) -> usize {
        self.batch.lock().size()
    }

    /// Take the batch for commit, leaving the transaction empty.
    pub fn take(&self) -> Batch {
        std::mem::take(&mut *self.batch.lock())
    }

    /// Hold a member's notification until the owner commits.
    pub fn defer(&self, notice: Notice) {
        self.deferred.lock().push(notice);
    }

    /// Notifications held for release, in staging order.
    pub fn take_deferred(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.deferred.lock())
    }
}

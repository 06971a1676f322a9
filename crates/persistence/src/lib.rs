// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! hsvm-persistence: the storage collaborator of the evaluation engine.
//!
//! Events are indexed into logical columns through a write-ahead `Batch`
//! which is committed atomically: appended to a checksummed log, then applied
//! to the in-memory columns under one write lock.

pub mod batch;
pub mod column;
pub mod error;
pub mod fixtures;
pub mod index;
pub mod query;
pub mod store;
pub mod wal;

pub use batch::{Batch, Op};
pub use column::{Column, RefKind};
pub use error::{PersistenceError, Result};
pub use index::{index, Appendix, WriteOp, WriteOpts};
pub use query::HeadEntry;
pub use store::Store;

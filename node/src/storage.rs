// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The engine's view of the database.
//!
//! The VM never touches columns directly. It indexes into batches, commits
//! them, and asks the questions below. `Store` answers them from its columns;
//! tests substitute stores that fail or observe.

use hsvm_kernel::{Event, EventId, RoomId, ServerName};
use hsvm_persistence::{Batch, HeadEntry, PersistenceError, Store, WriteOpts};

pub type StorageResult<T> = Result<T, PersistenceError>;

pub trait Storage: Send + Sync {
    /// Stage the mutations for `event`; returns how many were staged.
    fn index(&self, batch: &mut Batch, event: &Event, wopts: &WriteOpts) -> usize {
        hsvm_persistence::index(batch, event, wopts)
    }

    /// Make `batch` durable and visible. Returns the batch number.
    fn commit(&self, batch: Batch) -> StorageResult<u64>;

    fn exists(&self, event_id: &EventId) -> bool;

    fn count_present(&self, ids: &[EventId]) -> usize {
        ids.iter().filter(|id| self.exists(id)).count()
    }

    /// Warm lookups the later phases will make. Returns how many of the
    /// event's references are already present.
    fn prefetch(&self, event: &Event) -> usize {
        self.count_present(event.prev_events()) + self.count_present(event.auth_events())
    }

    fn get_event(&self, event_id: &EventId) -> StorageResult<Option<Event>>;

    fn room_depth(&self, room_id: &RoomId) -> Option<i64>;

    fn room_head(&self, room_id: &RoomId, limit: usize) -> Vec<HeadEntry>;

    fn state_event(&self, room_id: &RoomId, kind: &str, state_key: &str) -> StorageResult<Option<Event>>;

    fn room_version(&self, room_id: &RoomId) -> StorageResult<Option<String>>;

    fn room_servers(&self, room_id: &RoomId) -> Vec<ServerName>;

    fn local_joined(&self, room_id: &RoomId, server: &ServerName) -> bool;

    fn backfill(&self, room_id: &RoomId, from: &EventId, limit: usize) -> StorageResult<Vec<Event>>;

    fn auth_chain(&self, event_id: &EventId) -> StorageResult<Vec<Event>>;

    /// Highest event index written.
    fn last_sequence(&self) -> u64;
}

impl Storage for Store {
    fn commit(&self, batch: Batch) -> StorageResult<u64> {
        self.write(batch)
    }

    fn exists(&self, event_id: &EventId) -> bool {
        Store::exists(self, event_id)
    }

    fn count_present(&self, ids: &[EventId]) -> usize {
        Store::count_present(self, ids)
    }

    fn get_event(&self, event_id: &EventId) -> StorageResult<Option<Event>> {
        Store::get_event(self, event_id)
    }

    fn room_depth(&self, room_id: &RoomId) -> Option<i64> {
        Store::room_depth(self, room_id)
    }

    fn room_head(&self, room_id: &RoomId, limit: usize) -> Vec<HeadEntry> {
        Store::room_head(self, room_id, limit)
    }

    fn state_event(&self, room_id: &RoomId, kind: &str, state_key: &str) -> StorageResult<Option<Event>> {
        Store::state_event(self, room_id, kind, state_key)
    }

    fn room_version(&self, room_id: &RoomId) -> StorageResult<Option<String>> {
        Store::room_version(self, room_id)
    }

    fn room_servers(&self, room_id: &RoomId) -> Vec<ServerName> {
        Store::room_servers(self, room_id)
    }

    fn local_joined(&self, room_id: &RoomId, server: &ServerName) -> bool {
        Store::local_joined(self, room_id, server)
    }

    fn backfill(&self, room_id: &RoomId, from: &EventId, limit: usize) -> StorageResult<Vec<Event>> {
        Store::backfill(self, room_id, from, limit)
    }

    fn auth_chain(&self, event_id: &EventId) -> StorageResult<Vec<Event>> {
        Store::auth_chain(self, event_id)
    }

    fn last_sequence(&self) -> u64 {
        Store::last_sequence(self)
    }
}

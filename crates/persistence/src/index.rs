// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Event indexing.
//!
//! `index` translates one event into mutations across the columns. Which
//! columns are touched is chosen by the caller through `WriteOpts`; the
//! indexer itself never reads the store, so staging is free of I/O.

use crate::batch::Batch;
use crate::column::{self, Column, RefKind};
use bitflags::bitflags;
use hsvm_kernel::Event;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    #[default]
    Set,
    Delete,
}

bitflags! {
    /// Columns an index pass may touch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Appendix: u32 {
        const EVENT_IDX = 1 << 0;
        const EVENT_JSON = 1 << 1;
        const ROOM_EVENTS = 1 << 2;
        const ROOM_STATE = 1 << 3;
        const ROOM_JOINED = 1 << 4;
        const ROOM_HEAD = 1 << 5;
        /// Remove the event's prev_events from the room head.
        const ROOM_HEAD_RESOLVE = 1 << 6;
        const EVENT_REFS = 1 << 7;
    }
}

impl Default for Appendix {
    fn default() -> Self {
        Appendix::all()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOpts {
    pub op: WriteOp,
    /// Index assigned to the event; the evaluation's sequence number.
    pub event_idx: u64,
    pub appendix: Appendix,
}

/// Stage the mutations for `event` into `batch`. Returns how many were
/// staged; EDUs stage nothing.
pub fn index(batch: &mut Batch, event: &Event, opts: &WriteOpts) -> usize {
    let (Some(event_id), Some(room_id)) = (event.event_id(), event.room_id()) else {
        return 0;
    };

    let before = batch.size();
    let idx = opts.event_idx;
    let id = event_id.as_str();
    let room = room_id.as_str();
    let set = opts.op == WriteOp::Set;
    let a = opts.appendix;

    let put = |batch: &mut Batch, column: Column, key: Vec<u8>, value: Vec<u8>| {
        if set {
            batch.set(column, key, value);
        } else {
            batch.delete(column, key);
        }
    };

    if a.contains(Appendix::EVENT_IDX) {
        put(batch, Column::EventIdx, column::event_idx_key(id), column::u64_bytes(idx).to_vec());
    }

    if a.contains(Appendix::EVENT_JSON) {
        put(batch, Column::EventJson, column::event_json_key(idx), event.canonical_bytes());
    }

    if a.contains(Appendix::ROOM_EVENTS) {
        put(batch, Column::RoomEvents, column::room_events_key(room, event.depth(), idx), Vec::new());
    }

    if a.contains(Appendix::ROOM_STATE) {
        if let Some(state_key) = event.state_key() {
            let key = column::room_state_key(room, event.kind(), state_key);
            put(batch, Column::RoomState, key, column::u64_bytes(idx).to_vec());
        }
    }

    if a.contains(Appendix::ROOM_JOINED) {
        if let (Some(membership), Some(target)) = (event.membership(), event.state_key()) {
            if let Some(server) = hsvm_kernel::UserId::parse(target).ok().and_then(|u| u.host()) {
                let key = column::room_joined_key(room, server.as_str(), target);
                match (set, membership) {
                    (true, "join") => batch.set(Column::RoomJoined, key, column::u64_bytes(idx).to_vec()),
                    _ => batch.delete(Column::RoomJoined, key),
                }
            }
        }
    }

    if a.contains(Appendix::ROOM_HEAD) {
        let value = column::room_head_value(idx, event.depth());
        put(batch, Column::RoomHead, column::room_head_key(room, id), value);
    }

    if set && a.contains(Appendix::ROOM_HEAD_RESOLVE) {
        for prev in event.prev_events() {
            batch.delete(Column::RoomHead, column::room_head_key(room, prev.as_str()));
        }
    }

    if a.contains(Appendix::EVENT_REFS) {
        for prev in event.prev_events() {
            put(batch, Column::EventRefs, column::event_refs_key(prev.as_str(), RefKind::Prev, idx), Vec::new());
        }
        for auth in event.auth_events() {
            put(batch, Column::EventRefs, column::event_refs_key(auth.as_str(), RefKind::Auth, idx), Vec::new());
        }
        if let Some(target) = event.redacts() {
            put(batch, Column::EventRefs, column::event_refs_key(target.as_str(), RefKind::Redacts, idx), Vec::new());
        }
    }

    batch.size() - before
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Logical columns and their key layouts.
//!
//! Keys are byte strings ordered lexicographically. Integer components are
//! big-endian so that range scans follow numeric order; signed depths are
//! stored with the sign bit flipped for the same reason. String components
//! are separated by a NUL byte.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Column {
    /// event_id -> event_idx
    EventIdx = 0,
    /// event_idx -> canonical JSON
    EventJson = 1,
    /// room, depth, event_idx -> ()
    RoomEvents = 2,
    /// room, type, state_key -> event_idx (present state)
    RoomState = 3,
    /// room, event_id -> event_idx, depth (events nothing references yet)
    RoomHead = 4,
    /// target event_id, kind, source event_idx -> ()
    EventRefs = 5,
    /// room, server, user -> event_idx of the join
    RoomJoined = 6,
}

impl Column {
    pub const COUNT: usize = 7;

    pub const ALL: [Column; Column::COUNT] = [
        Column::EventIdx,
        Column::EventJson,
        Column::RoomEvents,
        Column::RoomState,
        Column::RoomHead,
        Column::EventRefs,
        Column::RoomJoined,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::EventIdx => "event_idx",
            Column::EventJson => "event_json",
            Column::RoomEvents => "room_events",
            Column::RoomState => "room_state",
            Column::RoomHead => "room_head",
            Column::EventRefs => "event_refs",
            Column::RoomJoined => "room_joined",
        }
    }
}

/// Kind of a reverse reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RefKind {
    Prev = 0,
    Auth = 1,
    Redacts = 2,
}

pub const SEP: u8 = 0;

pub fn u64_bytes(v: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, v);
    buf
}

pub fn read_u64(buf: &[u8]) -> Option<u64> {
    (buf.len() >= 8).then(|| BigEndian::read_u64(&buf[..8]))
}

pub fn depth_bytes(depth: i64) -> [u8; 8] {
    u64_bytes((depth as u64) ^ (1 << 63))
}

pub fn read_depth(buf: &[u8]) -> Option<i64> {
    read_u64(buf).map(|v| (v ^ (1 << 63)) as i64)
}

/// Join string components with the separator, plus a trailing separator so
/// the result can serve as a scan prefix.
pub fn prefix(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        key.extend_from_slice(part.as_bytes());
        key.push(SEP);
    }
    key
}

pub fn event_idx_key(event_id: &str) -> Vec<u8> {
    event_id.as_bytes().to_vec()
}

pub fn event_json_key(idx: u64) -> Vec<u8> {
    u64_bytes(idx).to_vec()
}

pub fn room_events_key(room_id: &str, depth: i64, idx: u64) -> Vec<u8> {
    let mut key = prefix(&[room_id]);
    key.extend_from_slice(&depth_bytes(depth));
    key.extend_from_slice(&u64_bytes(idx));
    key
}

pub fn room_state_key(room_id: &str, kind: &str, state_key: &str) -> Vec<u8> {
    let mut key = prefix(&[room_id, kind]);
    key.extend_from_slice(state_key.as_bytes());
    key
}

pub fn room_head_key(room_id: &str, event_id: &str) -> Vec<u8> {
    let mut key = prefix(&[room_id]);
    key.extend_from_slice(event_id.as_bytes());
    key
}

pub fn room_head_value(idx: u64, depth: i64) -> Vec<u8> {
    let mut val = u64_bytes(idx).to_vec();
    val.extend_from_slice(&depth_bytes(depth));
    val
}

pub fn event_refs_key(target: &str, kind: RefKind, source_idx: u64) -> Vec<u8> {
    let mut key = prefix(&[target]);
    key.push(kind as u8);
    key.extend_from_slice(&u64_bytes(source_idx));
    key
}

pub fn room_joined_key(room_id: &str, server: &str, user: &str) -> Vec<u8> {
    let mut key = prefix(&[room_id, server]);
    key.extend_from_slice(user.as_bytes());
    key
}

/// Split the string components of a key.
pub fn split(key: &[u8]) -> Vec<&[u8]> {
    key.split(|b| *b == SEP).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_keys_sort_numerically() {
        let a = room_events_key("!r:a", -1, 9);
        let b = room_events_key("!r:a", 0, 1);
        let c = room_events_key("!r:a", 300, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_depth_roundtrip() {
        for depth in [-5i64, 0, 1, i64::MAX] {
            assert_eq!(read_depth(&depth_bytes(depth)), Some(depth));
        }
    }
}

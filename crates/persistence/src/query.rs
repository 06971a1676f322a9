// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Read queries over the columns.
//!
//! Every query takes the store's read lock once per column access and never
//! across calls; results reflect some committed prefix of the log.

use crate::column::{self, Column, RefKind};
use crate::error::Result;
use crate::store::Store;
use hsvm_kernel::{Event, EventId, RoomId, ServerName};
use std::collections::{BTreeSet, VecDeque};

/// A room head entry: an event nothing references yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadEntry {
    pub event_id: EventId,
    pub event_idx: u64,
    pub depth: i64,
}

impl Store {
    pub fn event_idx(&self, event_id: &EventId) -> Option<u64> {
        self.get(Column::EventIdx, &column::event_idx_key(event_id.as_str()))
            .and_then(|v| column::read_u64(&v))
    }

    pub fn exists(&self, event_id: &EventId) -> bool {
        self.contains(Column::EventIdx, &column::event_idx_key(event_id.as_str()))
    }

    /// How many of `ids` are stored.
    pub fn count_present(&self, ids: &[EventId]) -> usize {
        ids.iter().filter(|id| self.exists(id)).count()
    }

    pub fn event_by_idx(&self, idx: u64) -> Result<Option<Event>> {
        let Some(raw) = self.get(Column::EventJson, &column::event_json_key(idx)) else {
            return Ok(None);
        };
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| crate::PersistenceError::InvalidFormat(e.to_string()))?;
        Ok(Some(Event::from_json(value)?))
    }

    pub fn get_event(&self, event_id: &EventId) -> Result<Option<Event>> {
        match self.event_idx(event_id) {
            Some(idx) => self.event_by_idx(idx),
            None => Ok(None),
        }
    }

    /// Greatest depth of any stored event in the room.
    pub fn room_depth(&self, room_id: &RoomId) -> Option<i64> {
        let prefix = column::prefix(&[room_id.as_str()]);
        let (key, _) = self.last(Column::RoomEvents, &prefix)?;
        column::read_depth(&key[prefix.len()..])
    }

    /// Head of the room, deepest first, at most `limit` entries.
    pub fn room_head(&self, room_id: &RoomId, limit: usize) -> Vec<HeadEntry> {
        let prefix = column::prefix(&[room_id.as_str()]);
        let mut head: Vec<HeadEntry> = self
            .prefix(Column::RoomHead, &prefix)
            .into_iter()
            .filter_map(|(key, val)| {
                let id = std::str::from_utf8(&key[prefix.len()..]).ok()?;
                Some(HeadEntry {
                    event_id: EventId::parse(id).ok()?,
                    event_idx: column::read_u64(&val)?,
                    depth: column::read_depth(val.get(8..)?)?,
                })
            })
            .collect();
        head.sort_by(|a, b| b.depth.cmp(&a.depth).then_with(|| b.event_idx.cmp(&a.event_idx)));
        head.truncate(limit);
        head
    }

    pub fn state_idx(&self, room_id: &RoomId, kind: &str, state_key: &str) -> Option<u64> {
        self.get(Column::RoomState, &column::room_state_key(room_id.as_str(), kind, state_key))
            .and_then(|v| column::read_u64(&v))
    }

    pub fn state_event(&self, room_id: &RoomId, kind: &str, state_key: &str) -> Result<Option<Event>> {
        match self.state_idx(room_id, kind, state_key) {
            Some(idx) => self.event_by_idx(idx),
            None => Ok(None),
        }
    }

    /// Version of a room according to its create event.
    pub fn room_version(&self, room_id: &RoomId) -> Result<Option<String>> {
        Ok(self.state_event(room_id, "m.room.create", "")?.map(|create| {
            create
                .content()
                .get("room_version")
                .and_then(|v| v.as_str())
                .unwrap_or("1")
                .to_string()
        }))
    }

    /// Servers with at least one joined member in the room.
    pub fn room_servers(&self, room_id: &RoomId) -> Vec<ServerName> {
        let prefix = column::prefix(&[room_id.as_str()]);
        let servers: BTreeSet<ServerName> = self
            .prefix(Column::RoomJoined, &prefix)
            .into_iter()
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                let server = column::split(rest).first().copied()?;
                ServerName::parse(std::str::from_utf8(server).ok()?).ok()
            })
            .collect();
        servers.into_iter().collect()
    }

    pub fn local_joined(&self, room_id: &RoomId, server: &ServerName) -> bool {
        let prefix = column::prefix(&[room_id.as_str(), server.as_str()]);
        !self.prefix(Column::RoomJoined, &prefix).is_empty()
    }

    /// Indexes of events referencing `target` in the given way.
    pub fn refs(&self, target: &EventId, kind: RefKind) -> Vec<u64> {
        let mut prefix = column::prefix(&[target.as_str()]);
        prefix.push(kind as u8);
        self.prefix(Column::EventRefs, &prefix)
            .into_iter()
            .filter_map(|(key, _)| column::read_u64(&key[prefix.len()..]))
            .collect()
    }

    /// Event indexes of the room in (depth, idx) order.
    pub fn room_events(&self, room_id: &RoomId) -> Vec<(i64, u64)> {
        let prefix = column::prefix(&[room_id.as_str()]);
        self.prefix(Column::RoomEvents, &prefix)
            .into_iter()
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                Some((column::read_depth(rest)?, column::read_u64(rest.get(8..)?)?))
            })
            .collect()
    }

    /// Up to `limit` events at and before `from`, walking prev_events
    /// breadth-first.
    pub fn backfill(&self, room_id: &RoomId, from: &EventId, limit: usize) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(id) = queue.pop_front() {
            if out.len() >= limit {
                break;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(event) = self.get_event(&id)? else {
                continue;
            };
            if event.room_id() != Some(room_id) {
                continue;
            }
            queue.extend(event.prev_events().iter().cloned());
            out.push(event);
        }
        Ok(out)
    }

    /// Transitive closure of auth_events, excluding the event itself,
    /// ancestors first.
    pub fn auth_chain(&self, event_id: &EventId) -> Result<Vec<Event>> {
        let Some(event) = self.get_event(event_id)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<EventId> = event.auth_events().iter().cloned().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(auth) = self.get_event(&id)? {
                queue.extend(auth.auth_events().iter().cloned());
                out.push(auth);
            }
        }
        out.sort();
        Ok(out)
    }
}

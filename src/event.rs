// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The Event Record.
//!
//! An `Event` wraps the JSON object received from a peer, a client, or
//! composed locally, together with its distinguished fields parsed once.
//!
//! # Invariants
//! - Fields never change after construction; clones share one allocation.
//! - `event_id` is `None` only for EDUs.
//! - Derived values (content hash, reference id, signatures) are computed
//!   only by explicit construction: `Event::from_pdu` or `verify::seal`.

use crate::config::EVENT_MAX_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::hash;
use crate::types::id::{EventId, RoomId, ServerName, UserId};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

struct Inner {
    event_id: Option<EventId>,
    room_id: Option<RoomId>,
    kind: String,
    sender: Option<UserId>,
    origin: Option<ServerName>,
    state_key: Option<String>,
    depth: i64,
    origin_server_ts: i64,
    prev_events: Vec<EventId>,
    auth_events: Vec<EventId>,
    redacts: Option<EventId>,
    source: Value,
}

impl Event {
    /// Parse a record as given. The id is taken from its `event_id` field; a
    /// record without one is an EDU.
    pub fn from_json(source: Value) -> KernelResult<Self> {
        let id = match source.get("event_id") {
            Some(Value::String(s)) => Some(EventId::parse(s.as_str())?),
            Some(Value::Null) | None => None,
            Some(_) => return Err(KernelError::WrongType("event_id")),
        };
        Self::build(source, id)
    }

    /// Parse a PDU, deriving its reference id when the record carries none.
    pub fn from_pdu(source: Value) -> KernelResult<Self> {
        match source.get("event_id") {
            Some(Value::String(_)) => Self::from_json(source),
            _ => {
                let id = hash::reference_id(&source);
                Self::with_id(source, id)
            }
        }
    }

    /// Parse a record under an id known out of band.
    pub fn with_id(mut source: Value, id: EventId) -> KernelResult<Self> {
        let obj = source.as_object_mut().ok_or(KernelError::NotAnObject)?;
        obj.insert("event_id".into(), Value::String(id.to_string()));
        Self::build(source, Some(id))
    }

    fn build(source: Value, event_id: Option<EventId>) -> KernelResult<Self> {
        let obj = source.as_object().ok_or(KernelError::NotAnObject)?;

        let size = serialized_size(&source);
        if size > EVENT_MAX_SIZE {
            return Err(KernelError::TooLarge { size, max: EVENT_MAX_SIZE });
        }

        let inner = Inner {
            event_id,
            room_id: opt_id(obj, "room_id")?,
            kind: opt_str(obj, "type")?.unwrap_or_default(),
            sender: opt_id(obj, "sender")?,
            origin: opt_id(obj, "origin")?,
            state_key: opt_str(obj, "state_key")?,
            depth: opt_int(obj, "depth")?.unwrap_or(-1),
            origin_server_ts: opt_int(obj, "origin_server_ts")?.unwrap_or(0),
            prev_events: id_list(obj, "prev_events")?,
            auth_events: id_list(obj, "auth_events")?,
            redacts: opt_id(obj, "redacts")?,
            source,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn event_id(&self) -> Option<&EventId> {
        self.inner.event_id.as_ref()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.inner.room_id.as_ref()
    }

    /// The `type` field; empty when absent.
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn sender(&self) -> Option<&UserId> {
        self.inner.sender.as_ref()
    }

    pub fn origin(&self) -> Option<&ServerName> {
        self.inner.origin.as_ref()
    }

    pub fn state_key(&self) -> Option<&str> {
        self.inner.state_key.as_deref()
    }

    /// Depth in the room graph; `-1` when absent.
    pub fn depth(&self) -> i64 {
        self.inner.depth
    }

    pub fn origin_server_ts(&self) -> i64 {
        self.inner.origin_server_ts
    }

    pub fn prev_events(&self) -> &[EventId] {
        &self.inner.prev_events
    }

    pub fn auth_events(&self) -> &[EventId] {
        &self.inner.auth_events
    }

    pub fn redacts(&self) -> Option<&EventId> {
        self.inner.redacts.as_ref()
    }

    pub fn content(&self) -> &Value {
        self.inner.source.get("content").unwrap_or(&Value::Null)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.source.get(key)
    }

    /// The record as received, `event_id` included once known.
    pub fn source(&self) -> &Value {
        &self.inner.source
    }

    pub fn is_edu(&self) -> bool {
        self.inner.event_id.is_none()
    }

    pub fn is_state(&self) -> bool {
        self.inner.state_key.is_some()
    }

    pub fn is_create(&self) -> bool {
        self.inner.kind == "m.room.create" && self.state_key() == Some("")
    }

    /// Membership value of an `m.room.member` event.
    pub fn membership(&self) -> Option<&str> {
        if self.inner.kind != "m.room.member" {
            return None;
        }
        self.content().get("membership").and_then(Value::as_str)
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        hash::canonical_json(&self.inner.source).into_bytes()
    }

    pub fn serialized_len(&self) -> usize {
        serialized_size(&self.inner.source)
    }

    /// A redacted copy holding only the protocol-essential keys.
    pub fn essential(&self) -> KernelResult<Event> {
        Self::build(essential_json(&self.inner.source), self.inner.event_id.clone())
    }

    /// A copy with `key` set in its `unsigned` object. Unsigned data is
    /// outside the hashes and signatures, so the id still holds.
    pub fn with_unsigned(&self, key: &str, value: Value) -> KernelResult<Event> {
        let mut source = self.inner.source.clone();
        let obj = source.as_object_mut().ok_or(KernelError::NotAnObject)?;
        let unsigned = obj
            .entry("unsigned")
            .or_insert_with(|| Value::Object(Map::new()));
        match unsigned.as_object_mut() {
            Some(unsigned) => {
                unsigned.insert(key.to_string(), value);
            }
            None => *unsigned = serde_json::json!({ key: value }),
        }
        Self::build(source, self.inner.event_id.clone())
    }

    /// Compact single-line rendering for logs.
    pub fn pretty_oneline(&self) -> String {
        format!(
            "{} {} {} {} depth:{} prev:{} auth:{}{}",
            self.inner.event_id.as_ref().map(EventId::as_str).unwrap_or("<edu>"),
            self.inner.room_id.as_ref().map(RoomId::as_str).unwrap_or("<edu>"),
            self.inner.sender.as_ref().map(UserId::as_str).unwrap_or("-"),
            self.inner.kind,
            self.inner.depth,
            self.inner.prev_events.len(),
            self.inner.auth_events.len(),
            self.inner
                .state_key
                .as_ref()
                .map(|k| format!(" state_key:{k:?}"))
                .unwrap_or_default(),
        )
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty_oneline())
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.inner.event_id == other.inner.event_id && self.inner.source == other.inner.source
    }
}

impl Eq for Event {}

/// Batches are ordered ancestors-first: by depth, then by id.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner
            .depth
            .cmp(&other.inner.depth)
            .then_with(|| self.inner.event_id.cmp(&other.inner.event_id))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const ESSENTIAL_KEYS: &[&str] = &[
    "event_id",
    "type",
    "room_id",
    "sender",
    "state_key",
    "content",
    "hashes",
    "signatures",
    "depth",
    "prev_events",
    "auth_events",
    "origin",
    "origin_server_ts",
    "membership",
];

/// Redaction algorithm over raw JSON.
pub fn essential_json(source: &Value) -> Value {
    let Some(obj) = source.as_object() else {
        return source.clone();
    };

    let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
    let mut out = Map::new();
    for key in ESSENTIAL_KEYS {
        if let Some(v) = obj.get(*key) {
            out.insert((*key).to_string(), v.clone());
        }
    }

    let keep: &[&str] = match kind {
        "m.room.create" => &["creator", "room_version"],
        "m.room.member" => &["membership"],
        "m.room.join_rules" => &["join_rule"],
        "m.room.history_visibility" => &["history_visibility"],
        "m.room.power_levels" => &[
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        _ => &[],
    };

    let content = obj
        .get("content")
        .and_then(Value::as_object)
        .map(|c| {
            c.iter()
                .filter(|(k, _)| keep.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<_, _>>()
        })
        .unwrap_or_default();
    out.insert("content".into(), Value::Object(content));

    Value::Object(out)
}

fn serialized_size(source: &Value) -> usize {
    serde_json::to_vec(source).map(|v| v.len()).unwrap_or(usize::MAX)
}

fn opt_str(obj: &Map<String, Value>, key: &'static str) -> KernelResult<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(KernelError::WrongType(key)),
    }
}

fn opt_int(obj: &Map<String, Value>, key: &'static str) -> KernelResult<Option<i64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or(KernelError::WrongType(key)),
    }
}

fn opt_id<T>(obj: &Map<String, Value>, key: &'static str) -> KernelResult<Option<T>>
where
    T: TryFrom<String, Error = KernelError>,
{
    opt_str(obj, key)?.map(T::try_from).transpose()
}

/// Reference lists come as plain ids, or as `[id, {hashes}]` pairs in the
/// oldest room versions.
fn id_list(obj: &Map<String, Value>, key: &'static str) -> KernelResult<Vec<EventId>> {
    let Some(value) = obj.get(key) else {
        return Ok(Vec::new());
    };
    let arr = value.as_array().ok_or(KernelError::WrongType(key))?;
    arr.iter()
        .map(|item| {
            let s = match item {
                Value::String(s) => s.as_str(),
                Value::Array(pair) => pair
                    .first()
                    .and_then(Value::as_str)
                    .ok_or(KernelError::WrongType(key))?,
                _ => return Err(KernelError::WrongType(key)),
            };
            EventId::parse(s)
        })
        .collect()
}

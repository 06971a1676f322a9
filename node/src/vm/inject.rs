// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Issuing new local events.
//!
//! `inject` composes the protocol fields of an event the caller only sketched
//! (type, sender, state key, content), seals it with this server's key, and
//! evaluates it with the issue phase enabled.

use super::eval::Eval;
use super::fault::{Fault, VmError};
use super::opts::{Copts, PropMask};
use super::Vm;
use hsvm_kernel::config::DEFAULT_ROOM_VERSION;
use hsvm_kernel::verify::seal;
use hsvm_kernel::{Event, EventId, IdFormat, RoomId, UserId};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An event issued by `inject` and the outcome of its evaluation.
#[derive(Clone, Debug)]
pub struct Issued {
    pub event: Event,
    pub fault: Fault,
}

impl Vm {
    pub async fn inject(&self, fields: Value, content: Value, copts: Copts) -> Result<Issued, VmError> {
        let _activity = self.injecting();
        let Value::Object(mut source) = fields else {
            return Err(VmError::new(Fault::Invalid, "event fields must be an object"));
        };
        source.insert("content".into(), content);

        let Some(room_id) = opt_str(&source, "room_id") else {
            return self.inject_edu(source, copts).await;
        };
        let room_id = RoomId::parse(room_id)?;
        let kind = opt_str(&source, "type")
            .ok_or_else(|| VmError::new(Fault::Invalid, "event has no type"))?
            .to_string();
        let is_create = kind == "m.room.create" && opt_str(&source, "state_key") == Some("");

        if !source.contains_key("sender") {
            let sender = copts
                .opts
                .user_id
                .as_ref()
                .ok_or_else(|| VmError::new(Fault::Invalid, "event has no sender"))?;
            source.insert("sender".into(), json!(sender.as_str()));
        }

        let room_version = self.resolve_version(&room_id, &mut source, is_create, &copts)?;
        let prop = copts.prop_mask;

        if prop.contains(PropMask::PREV_EVENTS) && !source.contains_key("prev_events") {
            let (prev, depth) = self.compose_prev(&room_id, is_create)?;
            source.insert("prev_events".into(), json!(prev));
            if prop.contains(PropMask::DEPTH) && !source.contains_key("depth") {
                source.insert("depth".into(), json!(depth));
            }
        }
        if prop.contains(PropMask::DEPTH) && !source.contains_key("depth") {
            let depth = self.depth_after(&source)?;
            source.insert("depth".into(), json!(depth));
        }
        if prop.contains(PropMask::AUTH_EVENTS) && !source.contains_key("auth_events") {
            let auth = if is_create {
                Vec::new()
            } else {
                self.compose_auth(&room_id, &source)?
            };
            source.insert("auth_events".into(), json!(auth));
        }
        if prop.contains(PropMask::ORIGIN) {
            source.insert("origin".into(), json!(self.cfg.server_name.as_str()));
        }
        if prop.contains(PropMask::ORIGIN_SERVER_TS) && !source.contains_key("origin_server_ts") {
            source.insert("origin_server_ts".into(), json!(now_ms()));
        }

        let event = if prop.contains(PropMask::SIGNATURES | PropMask::HASHES | PropMask::EVENT_ID) {
            seal(
                Value::Object(source),
                &*self.keyring,
                &self.cfg.server_name,
                IdFormat::for_room_version(&room_version),
            )?
        } else {
            Event::from_pdu(Value::Object(source))?
        };

        debug!("inject {}", event.pretty_oneline());
        let mut copts = copts;
        copts.opts.room_version = Some(room_version);
        let fault = self.execute_issued(event.clone(), copts).await?;
        Ok(Issued { event, fault })
    }

    async fn inject_edu(&self, source: Map<String, Value>, copts: Copts) -> Result<Issued, VmError> {
        let event = Event::from_json(Value::Object(source))?;
        let mut copts = copts;
        copts.opts.edu = true;
        let fault = self.execute_issued(event.clone(), copts).await?;
        Ok(Issued { event, fault })
    }

    async fn execute_issued(&self, event: Event, copts: Copts) -> Result<Fault, VmError> {
        let opts = Arc::new(copts.opts.clone());
        let mut eval = Eval::root(self.seq.clone(), opts, Some(Arc::new(copts)), CancellationToken::new());
        self.execute_events(&mut eval, vec![event]).await
    }

    fn resolve_version(
        &self,
        room_id: &RoomId,
        source: &mut Map<String, Value>,
        is_create: bool,
        copts: &Copts,
    ) -> Result<String, VmError> {
        if let Some(version) = &copts.opts.room_version {
            return Ok(version.clone());
        }
        if is_create {
            let content = source
                .get_mut("content")
                .and_then(Value::as_object_mut)
                .ok_or_else(|| VmError::new(Fault::Invalid, "create event content must be an object"))?;
            let version = content
                .entry("room_version")
                .or_insert_with(|| json!(DEFAULT_ROOM_VERSION));
            return Ok(version.as_str().unwrap_or(DEFAULT_ROOM_VERSION).to_string());
        }
        self.store
            .room_version(room_id)?
            .ok_or_else(|| VmError::new(Fault::State, format!("room {room_id} is not known to this server")))
    }

    /// The room head as prev_events and the depth that follows it.
    fn compose_prev(&self, room_id: &RoomId, is_create: bool) -> Result<(Vec<String>, i64), VmError> {
        if is_create {
            return Ok((Vec::new(), 1));
        }
        let head = self.store.room_head(room_id, self.cfg.vm.inject_prev_limit);
        let Some(deepest) = head.iter().map(|h| h.depth).max() else {
            return Err(VmError::new(Fault::State, format!("room {room_id} has no head")));
        };
        let prev = head.iter().map(|h| h.event_id.to_string()).collect();
        Ok((prev, deepest + 1))
    }

    /// Depth for caller-supplied prev_events.
    fn depth_after(&self, source: &Map<String, Value>) -> Result<i64, VmError> {
        let mut depth = 0;
        for id in source.get("prev_events").and_then(Value::as_array).into_iter().flatten() {
            let Some(id) = id.as_str() else { continue };
            if let Some(prev) = self.store.get_event(&EventId::parse(id)?)? {
                depth = depth.max(prev.depth());
            }
        }
        Ok(depth + 1)
    }

    /// Auth events from present state: the create event, power levels, join
    /// rules for membership changes, and the memberships of sender and target.
    fn compose_auth(&self, room_id: &RoomId, source: &Map<String, Value>) -> Result<Vec<String>, VmError> {
        let kind = opt_str(source, "type").unwrap_or_default();
        let sender = opt_str(source, "sender").map(UserId::parse).transpose()?;

        let mut cells: Vec<(&str, String)> = vec![("m.room.create", String::new())];
        cells.push(("m.room.power_levels", String::new()));
        if let Some(sender) = &sender {
            cells.push(("m.room.member", sender.to_string()));
        }
        if kind == "m.room.member" {
            cells.push(("m.room.join_rules", String::new()));
            if let Some(target) = opt_str(source, "state_key") {
                cells.push(("m.room.member", target.to_string()));
            }
        }

        let mut auth: Vec<String> = Vec::new();
        for (kind, state_key) in cells {
            if let Some(event) = self.store.state_event(room_id, kind, &state_key)? {
                if let Some(id) = event.event_id().map(ToString::to_string) {
                    if !auth.contains(&id) {
                        auth.push(id);
                    }
                }
            }
        }
        if auth.is_empty() {
            return Err(VmError::new(Fault::State, format!("no create event for {room_id}")));
        }
        Ok(auth)
    }
}

fn opt_str<'a>(source: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    source.get(key).and_then(Value::as_str)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

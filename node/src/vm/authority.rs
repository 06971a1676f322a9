// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Authorization seam.
//!
//! Room authorization rules are supplied by the embedder. The VM consults the
//! authority at three points: against the event's own auth events (static),
//! against the state at the event (relative), and against the room's current
//! state (present). A refusal is reported as a reason string.

use crate::storage::Storage;
use hsvm_kernel::Event;

pub trait Authority: Send + Sync {
    fn check_static(&self, _event: &Event, _auth_events: &[Event]) -> Result<(), String> {
        Ok(())
    }

    fn check_relative(&self, _event: &Event, _store: &dyn Storage) -> Result<(), String> {
        Ok(())
    }

    fn check_present(&self, _event: &Event, _store: &dyn Storage) -> Result<(), String> {
        Ok(())
    }
}

/// Accepts everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct Permissive;

impl Authority for Permissive {}

/// Static checks every room version shares: the auth events must belong to
/// the same room and include its create event.
#[derive(Clone, Copy, Debug, Default)]
pub struct Structural;

impl Authority for Structural {
    fn check_static(&self, event: &Event, auth_events: &[Event]) -> Result<(), String> {
        if event.is_create() {
            return match auth_events.is_empty() {
                true => Ok(()),
                false => Err("create event has auth_events".into()),
            };
        }
        if let Some(foreign) = auth_events.iter().find(|a| a.room_id() != event.room_id()) {
            return Err(format!(
                "auth event {} belongs to another room",
                foreign.event_id().map(|id| id.as_str()).unwrap_or("<edu>")
            ));
        }
        if !auth_events.iter().any(Event::is_create) {
            return Err("auth_events do not include the room's create event".into());
        }
        Ok(())
    }

    fn check_present(&self, event: &Event, store: &dyn Storage) -> Result<(), String> {
        let (Some(room_id), Some(state_key)) = (event.room_id(), event.state_key()) else {
            return Ok(());
        };
        match store.state_event(room_id, event.kind(), state_key) {
            Ok(Some(current)) if current.depth() > event.depth() => Err(format!(
                "present state {} is deeper than the event",
                current.event_id().map(|id| id.as_str()).unwrap_or("?")
            )),
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Conformity report.
//!
//! `Conforms::check` inspects an event for format violations that need no
//! database access. Each violation is one bit; the report is clean when no
//! bit is set. Callers mask out bits they tolerate.

use crate::config::{AUTH_EVENTS_MAX, PREV_EVENTS_MAX};
use crate::event::Event;
use crate::hash;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Conforms: u64 {
        const INVALID_OR_MISSING_EVENT_ID = 1 << 0;
        const INVALID_OR_MISSING_ROOM_ID = 1 << 1;
        const INVALID_OR_MISSING_SENDER_ID = 1 << 2;
        const MISSING_TYPE = 1 << 3;
        const MISSING_ORIGIN = 1 << 4;
        const INVALID_ORIGIN = 1 << 5;
        const DEPTH_NEGATIVE = 1 << 6;
        const DEPTH_ZERO = 1 << 7;
        const MISSING_PREV_EVENTS = 1 << 8;
        const MISSING_AUTH_EVENTS = 1 << 9;
        const SELF_PREV_EVENT = 1 << 10;
        const SELF_AUTH_EVENT = 1 << 11;
        const DUP_PREV_EVENT = 1 << 12;
        const DUP_AUTH_EVENT = 1 << 13;
        const MANY_PREV_EVENTS = 1 << 14;
        const MANY_AUTH_EVENTS = 1 << 15;
        const MISSING_CONTENT_MEMBERSHIP = 1 << 16;
        const INVALID_MEMBER_STATE_KEY = 1 << 17;
        const MISSING_SIGNATURES = 1 << 18;
        const MISSING_ORIGIN_SIGNATURE = 1 << 19;
        const MISMATCH_HASHES = 1 << 20;
        const MISMATCH_EVENT_ID = 1 << 21;
        const MISMATCH_CREATE_SENDER = 1 << 22;
    }
}

impl Conforms {
    pub fn check(event: &Event) -> Self {
        let mut report = Conforms::empty();

        let Some(event_id) = event.event_id() else {
            report |= Conforms::INVALID_OR_MISSING_EVENT_ID;
            return report;
        };

        if event.room_id().is_none() {
            report |= Conforms::INVALID_OR_MISSING_ROOM_ID;
        }
        if event.sender().is_none() {
            report |= Conforms::INVALID_OR_MISSING_SENDER_ID;
        }
        if event.kind().is_empty() {
            report |= Conforms::MISSING_TYPE;
        }

        match event.origin() {
            None => report |= Conforms::MISSING_ORIGIN,
            Some(origin) => {
                let sender_host = event.sender().and_then(|s| s.host());
                if event.kind() != "m.room.member" && sender_host.as_ref() != Some(origin) {
                    report |= Conforms::INVALID_ORIGIN;
                }
            }
        }

        if event.depth() < 0 {
            report |= Conforms::DEPTH_NEGATIVE;
        } else if event.depth() == 0 && !event.is_create() {
            report |= Conforms::DEPTH_ZERO;
        }

        if !event.is_create() {
            if event.prev_events().is_empty() {
                report |= Conforms::MISSING_PREV_EVENTS;
            }
            if event.auth_events().is_empty() {
                report |= Conforms::MISSING_AUTH_EVENTS;
            }
        }

        if event.is_create() {
            let room_host = event.room_id().and_then(|r| r.host());
            let sender_host = event.sender().and_then(|s| s.host());
            if room_host != sender_host {
                report |= Conforms::MISMATCH_CREATE_SENDER;
            }
        }

        if event.prev_events().contains(event_id) {
            report |= Conforms::SELF_PREV_EVENT;
        }
        if event.auth_events().contains(event_id) {
            report |= Conforms::SELF_AUTH_EVENT;
        }
        if has_duplicates(event.prev_events()) {
            report |= Conforms::DUP_PREV_EVENT;
        }
        if has_duplicates(event.auth_events()) {
            report |= Conforms::DUP_AUTH_EVENT;
        }
        if event.prev_events().len() > PREV_EVENTS_MAX {
            report |= Conforms::MANY_PREV_EVENTS;
        }
        if event.auth_events().len() > AUTH_EVENTS_MAX {
            report |= Conforms::MANY_AUTH_EVENTS;
        }

        if event.kind() == "m.room.member" {
            if event.membership().is_none() {
                report |= Conforms::MISSING_CONTENT_MEMBERSHIP;
            }
            let valid_key = event
                .state_key()
                .map(|k| crate::types::id::UserId::parse(k).is_ok())
                .unwrap_or(false);
            if !valid_key {
                report |= Conforms::INVALID_MEMBER_STATE_KEY;
            }
        }

        match event.get("signatures").and_then(|s| s.as_object()) {
            None => report |= Conforms::MISSING_SIGNATURES,
            Some(sigs) if sigs.is_empty() => report |= Conforms::MISSING_SIGNATURES,
            Some(sigs) => {
                let signed_by_origin = event
                    .origin()
                    .map(|o| sigs.contains_key(o.as_str()))
                    .unwrap_or(false);
                if !signed_by_origin {
                    report |= Conforms::MISSING_ORIGIN_SIGNATURE;
                }
            }
        }

        if !hash::check_content_hash(event) {
            report |= Conforms::MISMATCH_HASHES;
        }
        if !hash::check_id(event) {
            report |= Conforms::MISMATCH_EVENT_ID;
        }

        report
    }

    pub fn clean(&self) -> bool {
        self.is_empty()
    }

    /// Report with tolerated bits removed.
    pub fn without(self, tolerated: Conforms) -> Self {
        self - tolerated
    }
}

fn has_duplicates<T: Ord>(items: &[T]) -> bool {
    let mut seen = BTreeSet::new();
    !items.iter().all(|item| seen.insert(item))
}

impl fmt::Display for Conforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Canonical JSON and event hashing.
//!
//! # Guarantees
//! - `canonical_json` is byte-identical for equal values regardless of the
//!   key order they were built with.
//! - Neither hash covers `event_id`, `signatures` or `unsigned`, so an id
//!   can be attached to a record without changing what it hashes to.

use crate::config::HASH_ALGORITHM;
use crate::event::{essential_json, Event};
use crate::types::id::{EventId, IdFormat};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde_json::Value;
use std::fmt::Write as _;

/// Keys sorted at every level, no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String(key.clone()));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn strip(value: &Value, keys: &[&str]) -> Value {
    let mut value = value.clone();
    if let Some(obj) = value.as_object_mut() {
        for key in keys {
            obj.remove(*key);
        }
    }
    value
}

/// Hash of the full content, as published in `hashes.blake3`.
pub fn content_hash(source: &Value) -> String {
    let body = strip(source, &["event_id", "unsigned", "signatures", "hashes"]);
    let digest = blake3::hash(canonical_json(&body).as_bytes());
    STANDARD_NO_PAD.encode(digest.as_bytes())
}

/// Bytes covered by an origin's signature: the redacted form, so that a
/// redaction never invalidates a signature.
pub fn signing_payload(source: &Value) -> Vec<u8> {
    let body = strip(&essential_json(source), &["event_id", "unsigned", "signatures"]);
    canonical_json(&body).into_bytes()
}

/// Reference hash id of a record in the hashed id format.
pub fn reference_id(source: &Value) -> EventId {
    let digest = blake3::hash(&signing_payload(source));
    let encoded = URL_SAFE_NO_PAD.encode(digest.as_bytes());
    // base64url output always satisfies the hashed id grammar.
    EventId::new_unchecked(format!("${encoded}"))
}

/// Whether a hashed id matches the content. Legacy ids cannot be checked.
pub fn check_id(event: &Event) -> bool {
    match event.event_id() {
        Some(id) if id.format() == IdFormat::Hashed => reference_id(event.source()) == *id,
        Some(_) => true,
        None => false,
    }
}

/// Whether the published content hash matches the record.
pub fn check_content_hash(event: &Event) -> bool {
    event
        .get("hashes")
        .and_then(|h| h.get(HASH_ALGORITHM))
        .and_then(Value::as_str)
        .map(|published| published == content_hash(event.source()))
        .unwrap_or(false)
}

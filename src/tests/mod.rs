// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod conforms_tests;

use crate::types::id::{IdFormat, ServerName};
use crate::verify::{seal, LocalKeyring};
use crate::Event;
use serde_json::{json, Value};

pub(crate) fn server(name: &str) -> ServerName {
    ServerName::parse(name).unwrap()
}

pub(crate) fn keyring() -> LocalKeyring {
    LocalKeyring::new()
        .with_derived(server("a.test"), "tests")
        .with_derived(server("b.test"), "tests")
}

pub(crate) fn message(prev: &[&str], depth: i64) -> Value {
    json!({
        "type": "m.room.message",
        "room_id": "!room:a.test",
        "sender": "@alice:a.test",
        "origin": "a.test",
        "origin_server_ts": 1_700_000_000_000i64,
        "depth": depth,
        "prev_events": prev,
        "auth_events": ["$create"],
        "content": {"msgtype": "m.text", "body": "hello"},
    })
}

pub(crate) fn sealed(source: Value) -> Event {
    seal(source, &keyring(), &server("a.test"), IdFormat::Hashed).unwrap()
}

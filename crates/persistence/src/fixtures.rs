// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sample data for tests and the CLI.

use crate::batch::Batch;
use crate::error::Result;
use crate::index::{index, WriteOpts};
use crate::store::Store;
use hsvm_kernel::types::id::IdFormat;
use hsvm_kernel::verify::seal;
use hsvm_kernel::{Event, LocalKeyring, ServerName};
use serde_json::{json, Value};
use std::path::Path;

pub const ORIGIN: &str = "fixture.test";
pub const ROOM: &str = "!fixture:fixture.test";
pub const USER: &str = "@admin:fixture.test";

pub fn keyring() -> LocalKeyring {
    LocalKeyring::new().with_derived(origin(), "fixtures")
}

fn origin() -> ServerName {
    ServerName::parse(ORIGIN).unwrap_or_else(|_| unreachable!("constant is a valid server name"))
}

fn sealed(source: Value) -> Event {
    seal(source, &keyring(), &origin(), IdFormat::Hashed)
        .unwrap_or_else(|e| unreachable!("fixture events always seal: {e}"))
}

fn id_of(event: &Event) -> String {
    event.event_id().map(|id| id.to_string()).unwrap_or_default()
}

/// A create event, the creator's join, and one message.
pub fn sample_room() -> Vec<Event> {
    let create = sealed(json!({
        "type": "m.room.create",
        "state_key": "",
        "room_id": ROOM,
        "sender": USER,
        "origin": ORIGIN,
        "origin_server_ts": 1_700_000_000_000i64,
        "depth": 1,
        "prev_events": [],
        "auth_events": [],
        "content": {"creator": USER, "room_version": "10"},
    }));
    let join = sealed(json!({
        "type": "m.room.member",
        "state_key": USER,
        "room_id": ROOM,
        "sender": USER,
        "origin": ORIGIN,
        "origin_server_ts": 1_700_000_000_001i64,
        "depth": 2,
        "prev_events": [id_of(&create)],
        "auth_events": [id_of(&create)],
        "content": {"membership": "join"},
    }));
    let message = sealed(json!({
        "type": "m.room.message",
        "room_id": ROOM,
        "sender": USER,
        "origin": ORIGIN,
        "origin_server_ts": 1_700_000_000_002i64,
        "depth": 3,
        "prev_events": [id_of(&join)],
        "auth_events": [id_of(&create), id_of(&join)],
        "content": {"msgtype": "m.text", "body": "hello"},
    }));
    vec![create, join, message]
}

/// Write each event in its own batch, indexed 1..=n.
pub fn load(store: &Store, events: &[Event]) -> Result<()> {
    for (i, event) in events.iter().enumerate() {
        let mut batch = Batch::new();
        let opts = WriteOpts {
            event_idx: i as u64 + 1,
            ..Default::default()
        };
        index(&mut batch, event, &opts);
        store.write(batch)?;
    }
    Ok(())
}

/// A durable store under `dir` holding the sample room.
pub fn generate_store(dir: &Path) -> Result<Store> {
    let store = Store::open(dir)?;
    load(&store, &sample_room())?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal;
    use tempfile::tempdir;

    #[test]
    fn test_fixture_generator() {
        let dir = tempdir().unwrap();
        let store = generate_store(dir.path()).unwrap();
        assert_eq!(store.batches(), 3);
        assert_eq!(store.last_sequence(), 3);

        let path = store.wal_path().unwrap().to_path_buf();
        drop(store);

        let mut count = 0;
        for record in wal::read_stream(&path).unwrap() {
            let record = record.unwrap();
            count += 1;
            assert_eq!(record.header.batch, count);
            assert!(!record.ops().unwrap().is_empty());
        }
        assert_eq!(count, 3);
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use hsvm_kernel::{Event, RoomId};
use hsvm_persistence::column::read_u64;
use hsvm_persistence::{Column, Store};
use std::path::Path;

/// Events in the order they were committed, optionally for one room.
pub fn collect(store: &Store, room: Option<&RoomId>) -> anyhow::Result<Vec<(u64, Event)>> {
    let indexes: Vec<u64> = match room {
        Some(room_id) => {
            let mut idx: Vec<u64> = store.room_events(room_id).into_iter().map(|(_, i)| i).collect();
            idx.sort_unstable();
            idx
        }
        None => store
            .prefix(Column::EventJson, &[])
            .into_iter()
            .filter_map(|(key, _)| read_u64(&key))
            .collect(),
    };

    let mut out = Vec::with_capacity(indexes.len());
    for idx in indexes {
        if let Some(event) = store.event_by_idx(idx)? {
            out.push((idx, event));
        }
    }
    Ok(out)
}

pub fn run(dir: &Path, room: Option<&str>) -> anyhow::Result<()> {
    let store = Store::open(dir)?;
    let room = room.map(RoomId::parse).transpose()?;
    let events = collect(&store, room.as_ref())?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Idx", "Timestamp", "Depth", "Type", "Sender", "Event"]);

    for (idx, event) in &events {
        let ts = chrono::DateTime::from_timestamp_millis(event.origin_server_ts())
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        table.add_row(vec![
            idx.to_string(),
            ts,
            event.depth().to_string(),
            event.kind().to_string(),
            event.sender().map(ToString::to_string).unwrap_or_default(),
            event.event_id().map(ToString::to_string).unwrap_or_default(),
        ]);
    }

    println!("\nEvent Timeline ({} events)\n", events.len());
    println!("{table}\n");

    Ok(())
}

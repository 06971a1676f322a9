// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};

use super::wal_path;
use hsvm_persistence::{wal, Column, Store};
use std::path::Path;

pub fn run(dir: &Path) -> anyhow::Result<()> {
    let w_path = wal_path(dir);

    println!("\nhsvm Status Report");
    println!("------------------");

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Item", "Status", "Details"]);

    if !w_path.exists() {
        table.add_row(vec!["WAL", "MISSING", &w_path.display().to_string()]);
        println!("{table}\n");
        return Ok(());
    }

    let size = std::fs::metadata(&w_path)?.len();
    match wal::read_stream(&w_path)?.collect::<Result<Vec<_>, _>>() {
        Ok(records) => {
            let ops: usize = records.iter().map(|r| r.header.payload_len as usize).sum();
            table.add_row(vec![
                "WAL",
                "FOUND",
                &format!("{} batches, {} payload bytes, {} bytes on disk", records.len(), ops, size),
            ]);
        }
        Err(e) => {
            table.add_row(vec!["WAL", "CORRUPT", &e.to_string()]);
            println!("{table}\n");
            return Ok(());
        }
    }

    let store = Store::open(dir)?;
    table.add_row(vec![
        "Sequence",
        "OK",
        &format!("last event index {}", store.last_sequence()),
    ]);
    for column in Column::ALL {
        table.add_row(vec![column.name(), "", &format!("{} cells", store.len(column))]);
    }

    println!("{table}\n");

    Ok(())
}

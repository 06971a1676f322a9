// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::timeline;
use super::wal_path;
use hsvm_kernel::hash::{check_content_hash, check_id};
use hsvm_persistence::{wal, PersistenceError, Store};
use serde::Serialize;
use std::path::Path;

/// Outcome of a verification pass.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub batches: u64,
    pub events: usize,
    /// Events whose content hash or reference id does not match.
    pub mismatched: Vec<String>,
}

/// Walk the log checking every checksum and the batch order, then recompute
/// the hashes of every stored event.
pub fn check(dir: &Path) -> anyhow::Result<Report> {
    let mut report = Report::default();
    for record in wal::read_stream(wal_path(dir))? {
        let record = record?;
        if record.header.batch != report.batches + 1 {
            return Err(PersistenceError::OutOfOrder {
                expected: report.batches + 1,
                found: record.header.batch,
            }
            .into());
        }
        record.ops()?;
        report.batches = record.header.batch;
    }

    let store = Store::open(dir)?;
    for (_, event) in timeline::collect(&store, None)? {
        report.events += 1;
        if !check_content_hash(&event) || !check_id(&event) {
            report
                .mismatched
                .push(event.event_id().map(ToString::to_string).unwrap_or_default());
        }
    }
    Ok(report)
}

pub fn run(dir: &Path, json: bool) -> anyhow::Result<()> {
    let report = check(dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.mismatched.is_empty() {
            anyhow::bail!("{} of {} events fail their hashes", report.mismatched.len(), report.events);
        }
        return Ok(());
    }

    if report.mismatched.is_empty() {
        println!("\n✅ VERIFIED\n");
        println!("Batches:  {}", report.batches);
        println!("Events:   {}\n", report.events);
        Ok(())
    } else {
        println!("\n❌ MISMATCHED HASHES\n");
        for id in &report.mismatched {
            println!("  {id}");
        }
        anyhow::bail!("{} of {} events fail their hashes", report.mismatched.len(), report.events)
    }
}

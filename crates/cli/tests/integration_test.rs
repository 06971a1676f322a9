// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use hsvm_cli::commands::{inspect, timeline, verify, wal_path};
use hsvm_kernel::RoomId;
use hsvm_persistence::fixtures;
use tempfile::tempdir;

#[test]
fn test_integration_workflow() {
    let dir = tempdir().unwrap();
    drop(fixtures::generate_store(dir.path()).unwrap());

    assert!(inspect::run(dir.path()).is_ok());
    assert!(verify::run(dir.path(), false).is_ok());
    assert!(verify::run(dir.path(), true).is_ok());
    assert!(timeline::run(dir.path(), Some(fixtures::ROOM)).is_ok());
}

#[test]
fn test_timeline_order() {
    let dir = tempdir().unwrap();
    let store = fixtures::generate_store(dir.path()).unwrap();

    let all = timeline::collect(&store, None).unwrap();
    let idx: Vec<u64> = all.iter().map(|(i, _)| *i).collect();
    assert_eq!(idx, vec![1, 2, 3]);
    assert_eq!(all[0].1.kind(), "m.room.create");

    let room = RoomId::parse(fixtures::ROOM).unwrap();
    assert_eq!(timeline::collect(&store, Some(&room)).unwrap().len(), 3);
    let other = RoomId::parse("!other:fixture.test").unwrap();
    assert!(timeline::collect(&store, Some(&other)).unwrap().is_empty());
}

#[test]
fn test_verify_report() {
    let dir = tempdir().unwrap();
    drop(fixtures::generate_store(dir.path()).unwrap());

    let report = verify::check(dir.path()).unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.events, 3);
    assert!(report.mismatched.is_empty());
}

#[test]
fn test_verify_detects_corruption() {
    let dir = tempdir().unwrap();
    drop(fixtures::generate_store(dir.path()).unwrap());

    let path = wal_path(dir.path());
    let mut bytes = std::fs::read(&path).unwrap();
    // Flip a byte inside the first record's payload.
    bytes[24] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    assert!(verify::check(dir.path()).is_err());
    assert!(verify::run(dir.path(), false).is_err());
}

#[test]
fn test_inspect_missing_log() {
    let dir = tempdir().unwrap();
    assert!(inspect::run(dir.path()).is_ok());
    assert!(!wal_path(dir.path()).exists());
}

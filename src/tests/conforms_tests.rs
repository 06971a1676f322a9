// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::{message, sealed};
use crate::Conforms;
use crate::Event;
use serde_json::json;

#[test]
fn test_sealed_event_is_clean() {
    let event = sealed(message(&["$prev"], 4));
    let report = Conforms::check(&event);
    assert!(report.clean(), "unexpected report: {report}");
}

#[test]
fn test_tampered_content_mismatches_hash() {
    let event = sealed(message(&["$prev"], 4));
    let mut source = event.source().clone();
    source["content"]["body"] = json!("tampered");
    let tampered = Event::from_json(source).unwrap();
    let report = Conforms::check(&tampered);
    assert!(report.contains(Conforms::MISMATCH_HASHES));
    // The reference hash covers the published hash, not the body.
    assert!(!report.contains(Conforms::MISMATCH_EVENT_ID));
}

#[test]
fn test_self_and_duplicate_references() {
    let event = sealed(message(&["$x", "$x"], 4));
    let mut source = event.source().clone();
    let own = event.event_id().unwrap().to_string();
    source["auth_events"] = json!([own]);
    let event = Event::from_json(source).unwrap();
    let report = Conforms::check(&event);
    assert!(report.contains(Conforms::DUP_PREV_EVENT));
    assert!(report.contains(Conforms::SELF_AUTH_EVENT));
}

#[test]
fn test_missing_prev_events_on_non_create() {
    let event = sealed(message(&[], 4));
    let report = Conforms::check(&event);
    assert!(report.contains(Conforms::MISSING_PREV_EVENTS));
    assert!(report.without(Conforms::MISSING_PREV_EVENTS).clean());
}

#[test]
fn test_report_display_lists_names() {
    let report = Conforms::MISSING_TYPE | Conforms::DEPTH_NEGATIVE;
    assert_eq!(report.to_string(), "MISSING_TYPE DEPTH_NEGATIVE");
}

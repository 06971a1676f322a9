// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use common::*;
use hsvm_node::fetch::{FetchError, FetchOpts, Op};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_requests_share_one_attempt() {
    let h = harness(config(), MockTransport::new().with_latency(Duration::from_millis(100)));
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    h.transport.serve(&[room.create.clone(), room.join.clone(), c.clone()]);

    let fetcher = h.vm.fetcher();
    let opts = FetchOpts::new(Op::Event, room_id(), id(&c), fetcher.config()).with_hint(Some(server(REMOTE)));

    let first = fetcher.start(opts.clone()).await.unwrap();
    assert!(fetcher.exists(Op::Event, &room_id(), &id(&c)));
    let second = fetcher.start(opts).await.unwrap();
    assert_eq!(fetcher.count(), 1);

    let (a, b) = tokio::join!(first, second);
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.origin, server(REMOTE));
    assert_eq!(a.pdus[0], c);
    assert_eq!(b.pdus[0], c);
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test]
async fn test_no_candidate_remote_resolves_without_network() {
    let h = harness(config(), MockTransport::new());
    // The room's host is this server and nobody else is joined.
    let stray = remote_event("m.room.message", BOB, None, json!({"body": "x"}), &[], &[]);

    let opts = FetchOpts::new(Op::Event, room_id(), id(&stray), h.vm.fetcher().config());
    let err = h.vm.fetcher().start(opts).await.unwrap().await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound { op: Op::Event, attempts: 0, .. }), "{err}");
    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(h.vm.fetcher().count(), 0);
}

#[tokio::test]
async fn test_errant_remote_is_skipped() {
    let h = harness(config(), MockTransport::new().with_errant(REMOTE));
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    h.transport.serve(&[room.create.clone(), room.join.clone(), c.clone()]);

    let opts = FetchOpts::new(Op::Event, room_id(), id(&c), h.vm.fetcher().config()).with_hint(Some(server(REMOTE)));
    let err = h.vm.fetcher().start(opts).await.unwrap().await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound { .. }));
    assert_eq!(h.transport.call_count(), 0);
}

#[tokio::test]
async fn test_failed_remote_is_not_retried() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    // Nothing served: the hinted remote answers 404.

    let opts = FetchOpts::new(Op::Backfill, room_id(), id(&c), h.vm.fetcher().config()).with_hint(Some(server(REMOTE)));
    let err = h.vm.fetcher().start(opts).await.unwrap().await.unwrap_err();
    match err {
        FetchError::NotFound { attempts, reason, .. } => {
            assert_eq!(attempts, 1);
            assert!(reason.contains("404"), "{reason}");
        }
        other => panic!("unexpected {other}"),
    }
    assert_eq!(h.transport.calls(), vec![(server(REMOTE), "backfill")]);
}

#[tokio::test]
async fn test_disabled_fetcher_refuses() {
    let mut cfg = config();
    cfg.fetch.enable = false;
    let h = harness(cfg, MockTransport::new());
    let stray = remote_event("m.room.message", BOB, None, json!({"body": "x"}), &[], &[]);

    let opts = FetchOpts::new(Op::Event, room_id(), id(&stray), h.vm.fetcher().config());
    assert!(matches!(h.vm.fetcher().start(opts).await, Err(FetchError::Disabled)));
}

#[tokio::test]
async fn test_timed_out_remote_falls_through_to_next() {
    let h = harness(config(), MockTransport::new().with_stall("slow.test"));
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    h.vm.execute(vec![c.clone()], hsvm_node::vm::Opts::from_remote(server(REMOTE))).await.unwrap();
    let m = bob_message("late", &c, &room);
    h.transport.serve(&[room.create.clone(), room.join.clone(), c.clone(), m.clone()]);

    let mut opts = FetchOpts::new(Op::Event, room_id(), id(&m), h.vm.fetcher().config()).with_hint(Some(server("slow.test")));
    opts.timeout = Some(Duration::from_millis(200));
    let result = h.vm.fetcher().start(opts).await.unwrap().await.unwrap();
    assert_eq!(result.origin, server(REMOTE));
    assert_eq!(result.pdus[0], m);
    assert_eq!(
        h.transport.calls(),
        vec![(server("slow.test"), "event"), (server(REMOTE), "event")]
    );
    assert_eq!(h.vm.fetcher().count(), 0);
}

#[tokio::test]
async fn test_attempt_limit_stops_after_timeout() {
    let h = harness(config(), MockTransport::new().with_stall("slow.test"));
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    h.vm.execute(vec![c.clone()], hsvm_node::vm::Opts::from_remote(server(REMOTE))).await.unwrap();
    let m = bob_message("late", &c, &room);
    h.transport.serve(&[room.create.clone(), room.join.clone(), c.clone(), m.clone()]);

    let mut opts = FetchOpts::new(Op::Event, room_id(), id(&m), h.vm.fetcher().config()).with_hint(Some(server("slow.test")));
    opts.timeout = Some(Duration::from_millis(200));
    opts.attempt_limit = 1;
    let err = h.vm.fetcher().start(opts).await.unwrap().await.unwrap_err();
    match err {
        FetchError::NotFound { attempts, reason, .. } => {
            assert_eq!(attempts, 1);
            assert!(reason.contains("timed out"), "{reason}");
        }
        other => panic!("unexpected {other}"),
    }
    assert_eq!(h.transport.calls(), vec![(server("slow.test"), "event")]);
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use common::*;
use async_trait::async_trait;
use hsvm_kernel::{Event, EventId};
use hsvm_node::vm::{Copts, Eval, Fault, FaultMask, Hook, Opts, Stage, Vm, VmError};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn from_remote() -> Opts {
    Opts::from_remote(server(REMOTE))
}

#[tokio::test]
async fn test_inject_into_fresh_room() {
    let h = harness(config(), MockTransport::new());
    assert_eq!(h.vm.counters().retired, 0);

    let issued = h
        .vm
        .inject(
            json!({"room_id": ROOM, "type": "m.room.create", "state_key": "", "sender": ALICE}),
            json!({"creator": ALICE}),
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(issued.fault, Fault::Accept);
    assert!(issued.event.prev_events().is_empty());
    assert_eq!(issued.event.depth(), 1);

    let a = id(&issued.event);
    assert_eq!(h.store.event_idx(&a), Some(1));
    let c = h.vm.counters();
    assert_eq!((c.retired, c.committed, c.uncommitted), (1, 1, 1));

    // Second evaluation of the same event is a duplicate.
    let fault = h.vm.execute(vec![issued.event.clone()], Opts::default()).await.unwrap();
    assert_eq!(fault, Fault::Exists);
    assert_eq!(h.vm.counters().retired, 1);
    assert_eq!(h.vm.live(), 0);
}

#[tokio::test]
async fn test_inject_composes_prev_and_auth() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;

    assert_eq!(room.join.prev_events(), &[id(&room.create)]);
    assert_eq!(room.join.auth_events(), &[id(&room.create)]);
    assert_eq!(room.join.depth(), 2);
    assert_eq!(room.join.origin(), Some(&server(LOCAL)));
    assert!(h.store.local_joined(&room_id(), &server(LOCAL)));
    assert_eq!(h.store.room_version(&room_id()).unwrap().as_deref(), Some("10"));
}

#[tokio::test]
async fn test_missing_prev_fetched_and_evaluated_first() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    let b = bob_message("hello", &c, &room);
    h.transport.serve(&[room.create.clone(), room.join.clone(), c.clone()]);

    let opts = Opts {
        fetch_prev_all: true,
        ..from_remote()
    };
    let fault = h.vm.execute(vec![b.clone()], opts).await.unwrap();
    assert_eq!(fault, Fault::Accept);

    let calls = h.transport.calls();
    assert_eq!(calls[0], (server(REMOTE), "backfill"));

    let seq_c = h.store.event_idx(&id(&c)).expect("prev event committed");
    let seq_b = h.store.event_idx(&id(&b)).expect("event committed");
    assert!(seq_b > seq_c, "{seq_b} <= {seq_c}");
    assert_eq!(h.vm.counters().retired, seq_b);
    assert_eq!(h.vm.live(), 0);
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);

    assert_eq!(h.vm.execute(vec![c.clone()], from_remote()).await.unwrap(), Fault::Accept);
    let batches = h.store.batches();
    let counters = h.vm.counters();

    assert_eq!(h.vm.execute(vec![c.clone()], from_remote()).await.unwrap(), Fault::Exists);
    assert_eq!(h.store.batches(), batches);
    assert_eq!(h.vm.counters().committed, counters.committed);

    // A batch skips what is already present.
    assert_eq!(h.vm.execute(vec![c, room.join], from_remote()).await.unwrap(), Fault::Accept);
    assert_eq!(h.store.batches(), batches);
}

#[tokio::test]
async fn test_fault_disposition() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;

    // No prev_events: does not conform.
    let bad = remote_event("m.room.message", BOB, None, json!({"body": "x"}), &[], &[&room.create]);

    let err = h.vm.execute(vec![bad.clone()], from_remote()).await.unwrap_err();
    assert_eq!(err.code, Fault::Invalid);
    assert!(err.message.contains("Non-conforming"), "{}", err.message);

    let opts = Opts {
        nothrows: FaultMask::all(),
        ..from_remote()
    };
    assert_eq!(h.vm.execute(vec![bad.clone()], opts).await.unwrap(), Fault::Invalid);

    // Batches swallow per-event faults.
    let good = bob_join(&room);
    let fault = h.vm.execute(vec![bad.clone(), good.clone()], from_remote()).await.unwrap();
    assert_eq!(fault, Fault::Accept);
    assert!(h.store.exists(&id(&good)));
    assert!(!h.store.exists(&id(&bad)));
    assert_eq!(h.vm.live(), 0);
}

#[tokio::test]
async fn test_unrelated_room_bounces() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);

    // Nobody local has joined yet.
    let other = harness(config(), MockTransport::new());
    let err = other.vm.execute(vec![c], from_remote()).await.unwrap_err();
    assert_eq!(err.code, Fault::Bounce);
}

#[tokio::test]
async fn test_dependencies_gate_evaluation() {
    let mut cfg = config();
    cfg.vm.fetch_enable = false;
    let h = harness(cfg, MockTransport::new());
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    let b = bob_message("hello", &c, &room);

    let opts = Opts {
        fetch_prev_all: true,
        ..from_remote()
    };
    let err = h.vm.execute(vec![b.clone()], opts).await.unwrap_err();
    assert_eq!(err.code, Fault::Event);
    assert!(!h.store.exists(&id(&b)));

    // An auth event nobody has.
    let stray = remote_event("m.room.member", BOB, Some(BOB), json!({"membership": "invite"}), &[&room.join], &[&room.create]);
    let d = remote_event("m.room.message", BOB, None, json!({"body": "x"}), &[&room.join], &[&room.create, &stray]);
    let err = h.vm.execute(vec![d.clone()], from_remote()).await.unwrap_err();
    assert_eq!(err.code, Fault::Auth);
    assert!(!h.store.exists(&id(&d)));

    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(h.vm.live(), 0);
}

#[tokio::test]
async fn test_missing_auth_chain_is_fetched() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    let d = remote_event("m.room.message", BOB, None, json!({"body": "x"}), &[&room.join], &[&room.create, &c]);
    h.transport.serve(&[room.create.clone(), room.join.clone(), c.clone(), d.clone()]);

    assert_eq!(h.vm.execute(vec![d.clone()], from_remote()).await.unwrap(), Fault::Accept);
    assert_eq!(h.transport.calls()[0], (server(REMOTE), "event_auth"));
    assert!(h.store.event_idx(&id(&c)) < h.store.event_idx(&id(&d)));
}

#[tokio::test]
async fn test_failed_commit_does_not_wedge_sequencer() {
    let store = Arc::new(InstrumentedStore::new());
    let vm = vm_on(config(), store.clone(), MockTransport::new());
    let room = local_room(&vm).await;
    let c = bob_join(&room);
    let before = vm.counters();

    store.fail_next(1);
    let err = vm.execute(vec![c.clone()], from_remote()).await.unwrap_err();
    assert_eq!(err.code, Fault::General);
    assert!(store.failed.load(std::sync::atomic::Ordering::Acquire));
    assert_eq!(vm.counters().committed, before.committed);
    assert_eq!(vm.live(), 0);

    assert_eq!(vm.execute(vec![c.clone()], from_remote()).await.unwrap(), Fault::Accept);
    assert!(store.inner.exists(&id(&c)));
    let after = vm.counters();
    assert_eq!(after.retired, after.committed);
}

#[tokio::test]
async fn test_cancelled_evaluation_is_interrupted() {
    let h = harness(config(), MockTransport::new().with_latency(Duration::from_secs(5)));
    let room = local_room(&h.vm).await;
    let c = bob_join(&room);
    let b = bob_message("hello", &c, &room);
    h.transport.serve(&[room.create.clone(), room.join.clone(), c.clone()]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = h.vm.execute_cancellable(vec![b.clone()], from_remote(), cancel).await.unwrap_err();
    assert_eq!(err.code, Fault::Interrupt);
    assert!(!h.store.exists(&id(&b)));
    assert_eq!(h.vm.live(), 0);

    // The sequencer still moves.
    assert_eq!(h.vm.execute(vec![c], from_remote()).await.unwrap(), Fault::Accept);
}

#[tokio::test]
async fn test_accepted_events_are_published() {
    let h = harness(config(), MockTransport::new());
    let mut rx = h.vm.subscribe();
    let room = local_room(&h.vm).await;

    assert_eq!(rx.recv().await.unwrap(), room.create);
    assert_eq!(rx.recv().await.unwrap(), room.join);

    let quiet = Opts {
        notify_clients: false,
        ..from_remote()
    };
    h.vm.execute(vec![bob_join(&room)], quiet).await.unwrap();
    assert!(rx.try_recv().is_err());
}

/// Refuses messages whose body is "spam".
struct NoSpam;

#[async_trait]
impl Hook for NoSpam {
    fn name(&self) -> &str {
        "no_spam"
    }

    fn matches(&self, event: &Event) -> bool {
        event.kind() == "m.room.message"
    }

    async fn handle(&self, _vm: &Vm, _eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        if event.content()["body"] == "spam" {
            return Err(VmError::new(Fault::DoNotWant, "spam"));
        }
        Ok(())
    }
}

/// Counts calls and always fails.
#[derive(Default)]
struct Broken(AtomicUsize);

#[async_trait]
impl Hook for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn handle(&self, _vm: &Vm, _eval: &mut Eval, _event: &Event) -> Result<(), VmError> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Err(VmError::new(Fault::General, "effect failed"))
    }
}

#[tokio::test]
async fn test_hooks_gate_and_observe() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;
    let join = bob_join(&room);
    assert_eq!(h.vm.execute(vec![join.clone()], from_remote()).await.unwrap(), Fault::Accept);

    let broken = Arc::new(Broken::default());
    h.vm.hooks().register(Stage::Eval, Arc::new(NoSpam));
    h.vm.hooks().register(Stage::Effect, broken.clone());
    assert_eq!(h.vm.hooks().count(Stage::Eval), 1);

    let spam = bob_message("spam", &join, &room);
    let err = h.vm.execute(vec![spam.clone()], from_remote()).await.unwrap_err();
    assert_eq!(err.code, Fault::DoNotWant);
    assert!(!h.store.exists(&id(&spam)));

    // Effect failures come after the commit and do not change the result.
    let ham = bob_message("ham", &join, &room);
    assert_eq!(h.vm.execute(vec![ham.clone()], from_remote()).await.unwrap(), Fault::Accept);
    assert!(h.store.exists(&id(&ham)));
    assert_eq!(broken.0.load(Ordering::Relaxed), 1);
    assert_eq!(h.vm.live(), 0);
}

#[tokio::test]
async fn test_interrupt_after_commit_still_accepts() {
    let store = Arc::new(InstrumentedStore::new());
    let vm = vm_on(config(), store.clone(), MockTransport::new());
    let room = local_room(&vm).await;
    let c = bob_join(&room);
    let mut rx = vm.subscribe();

    let cancel = CancellationToken::new();
    store.cancel_after_commit(cancel.clone());
    let fault = vm.execute_cancellable(vec![c.clone()], from_remote(), cancel.clone()).await.unwrap();
    assert_eq!(fault, Fault::Accept);
    assert!(cancel.is_cancelled());
    assert!(store.inner.exists(&id(&c)));

    let counters = vm.counters();
    assert_eq!((counters.retired, counters.committed, counters.uncommitted), (3, 3, 3));
    assert_eq!(rx.recv().await.unwrap(), c);
    assert_eq!(vm.live(), 0);
}

#[tokio::test]
async fn test_unresolved_prev_events_gate_only_when_required() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;
    // Nobody has c: every remote answers 404.
    let c = bob_join(&room);
    let b = bob_message("hello", &c, &room);

    let strict = Opts {
        fetch_prev_all: true,
        ..from_remote()
    };
    let err = h.vm.execute(vec![b.clone()], strict).await.unwrap_err();
    assert_eq!(err.code, Fault::Event);
    assert!(!h.store.exists(&id(&b)));
    assert!(h.transport.call_count() > 0);

    assert_eq!(h.vm.execute(vec![b.clone()], from_remote()).await.unwrap(), Fault::Accept);
    assert!(h.store.exists(&id(&b)));
    assert!(!h.store.exists(&id(&c)));
    assert_eq!(h.vm.live(), 0);
}

/// Evaluates `child` nested in the evaluation of `trigger`, while the
/// trigger's transaction is open.
struct Nest {
    trigger: EventId,
    child: Event,
}

#[async_trait]
impl Hook for Nest {
    fn name(&self) -> &str {
        "nest"
    }

    fn matches(&self, event: &Event) -> bool {
        event.event_id() == Some(&self.trigger)
    }

    async fn handle(&self, vm: &Vm, eval: &mut Eval, _event: &Event) -> Result<(), VmError> {
        vm.execute_child(eval, vec![self.child.clone()], Opts::from_remote(server(REMOTE)))
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_member_notification_waits_for_owner_commit() {
    let store = Arc::new(InstrumentedStore::new());
    let vm = vm_on(config(), store.clone(), MockTransport::new());
    let room = local_room(&vm).await;
    let join = bob_join(&room);
    assert_eq!(vm.execute(vec![join.clone()], from_remote()).await.unwrap(), Fault::Accept);

    let parent = bob_message("parent", &join, &room);
    let child = bob_message("child", &join, &room);
    vm.hooks().register(
        Stage::Post,
        Arc::new(Nest {
            trigger: id(&parent),
            child: child.clone(),
        }),
    );
    let mut rx = vm.subscribe();

    // The owner's commit fails: the member was never durable, so nobody hears of it.
    store.fail_next(1);
    let err = vm.execute(vec![parent.clone()], from_remote()).await.unwrap_err();
    assert_eq!(err.code, Fault::General);
    assert!(!store.inner.exists(&id(&child)));
    assert!(rx.try_recv().is_err());

    assert_eq!(vm.execute(vec![parent.clone()], from_remote()).await.unwrap(), Fault::Accept);
    assert!(store.inner.exists(&id(&parent)));
    assert!(store.inner.exists(&id(&child)));
    assert_eq!(rx.recv().await.unwrap(), parent);
    assert_eq!(rx.recv().await.unwrap(), child);

    let c = vm.counters();
    assert_eq!(c.retired, c.committed);
    assert_eq!(vm.live(), 0);
}

#[tokio::test]
async fn test_local_events_go_out_to_servers() {
    let h = harness(config(), MockTransport::new());
    let mut outbound = h.vm.subscribe_outbound();
    let room = local_room(&h.vm).await;
    assert_eq!(outbound.recv().await.unwrap(), room.create);
    assert_eq!(outbound.recv().await.unwrap(), room.join);

    // Received events are not relayed.
    h.vm.execute(vec![bob_join(&room)], from_remote()).await.unwrap();
    assert!(outbound.try_recv().is_err());

    let mut quiet = Copts::default();
    quiet.opts.notify_servers = false;
    let issued = h
        .vm
        .inject(
            json!({"room_id": ROOM, "type": "m.room.message", "sender": ALICE}),
            json!({"msgtype": "m.text", "body": "quiet"}),
            quiet,
        )
        .await
        .unwrap();
    assert_eq!(issued.fault, Fault::Accept);
    assert!(outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_client_txnid_is_echoed_to_clients() {
    let h = harness(config(), MockTransport::new());
    local_room(&h.vm).await;
    let mut rx = h.vm.subscribe();

    let copts = Copts {
        client_txnid: Some("m1".into()),
        ..Default::default()
    };
    let issued = h
        .vm
        .inject(
            json!({"room_id": ROOM, "type": "m.room.message", "sender": ALICE}),
            json!({"msgtype": "m.text", "body": "hi"}),
            copts,
        )
        .await
        .unwrap();

    let seen = rx.recv().await.unwrap();
    assert_eq!(seen.event_id(), issued.event.event_id());
    assert_eq!(seen.get("unsigned").unwrap()["transaction_id"], "m1");

    // Client data never reaches the database.
    let stored = h.store.get_event(&id(&issued.event)).unwrap().unwrap();
    assert!(stored.get("unsigned").is_none());
}

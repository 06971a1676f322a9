// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use common::*;
use hsvm_node::vm::{Fault, Opts};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_evaluations_commit_in_total_order() {
    let store = Arc::new(InstrumentedStore::new());
    let vm = vm_on(config(), store.clone(), MockTransport::new());
    let room = local_room(&vm).await;
    let join = bob_join(&room);
    assert_eq!(
        vm.execute(vec![join.clone()], Opts::from_remote(server(REMOTE))).await.unwrap(),
        Fault::Accept
    );
    let base = vm.counters().retired;

    let messages: Vec<_> = (0..32).map(|i| bob_message(&format!("m{i}"), &join, &room)).collect();
    let tasks: Vec<_> = messages
        .iter()
        .cloned()
        .map(|m| {
            let vm = vm.clone();
            tokio::spawn(async move { vm.execute(vec![m], Opts::from_remote(server(REMOTE))).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Fault::Accept);
    }

    // Commits reach the database strictly in sequence order.
    let commits = store.commits();
    assert!(commits.windows(2).all(|w| w[0] < w[1]), "out of order: {commits:?}");
    assert_eq!(commits.last().copied(), Some(base + 32));

    let mut seqs: Vec<u64> = messages.iter().map(|m| store.inner.event_idx(&id(m)).unwrap()).collect();
    seqs.sort_unstable();
    let expected: Vec<u64> = (base + 1..=base + 32).collect();
    assert_eq!(seqs, expected);

    let c = vm.counters();
    assert_eq!(c.retired, base + 32);
    assert_eq!(c.committed, base + 32);
    assert!(c.uncommitted >= c.committed);
    assert_eq!(vm.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_in_flight_evaluations_yield_one_accept() {
    let h = harness(config(), MockTransport::new());
    let room = local_room(&h.vm).await;
    let join = bob_join(&room);
    let batches = h.store.batches();

    let (a, b) = tokio::join!(
        h.vm.execute(vec![join.clone()], Opts::from_remote(server(REMOTE))),
        h.vm.execute(vec![join.clone()], Opts::from_remote(server(REMOTE))),
    );
    let mut faults = vec![a.unwrap(), b.unwrap()];
    faults.sort_by_key(|f| *f as u32);
    assert_eq!(faults, vec![Fault::Accept, Fault::Exists]);
    assert_eq!(h.store.batches(), batches + 1);
}

#[tokio::test]
async fn test_counters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let last = {
        let store = std::sync::Arc::new(hsvm_persistence::Store::open(dir.path()).unwrap());
        let vm = hsvm_node::vm::Vm::builder(config())
            .storage(store.clone())
            .keyring(std::sync::Arc::new(keyring()))
            .transport(std::sync::Arc::new(MockTransport::new()))
            .build();
        local_room(&vm).await;
        vm.fini().await;
        vm.counters().retired
    };
    assert_eq!(last, 2);

    let store = std::sync::Arc::new(hsvm_persistence::Store::open(dir.path()).unwrap());
    let vm = hsvm_node::vm::Vm::builder(config())
        .storage(store)
        .keyring(std::sync::Arc::new(keyring()))
        .transport(std::sync::Arc::new(MockTransport::new()))
        .build();
    let c = vm.counters();
    assert_eq!((c.retired, c.committed, c.uncommitted), (2, 2, 2));
}

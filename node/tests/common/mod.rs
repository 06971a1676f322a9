// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
#![allow(dead_code)]

use async_trait::async_trait;
use hsvm_kernel::verify::seal;
use hsvm_kernel::{Event, EventId, IdFormat, LocalKeyring, RoomId, ServerName};
use hsvm_node::config::NodeConfig;
use hsvm_node::network::{FedRequest, Transport, TransportError};
use hsvm_node::storage::{Storage, StorageResult};
use hsvm_node::vm::{Copts, Vm};
use hsvm_persistence::{fixtures, Batch, HeadEntry, PersistenceError, Store};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const LOCAL: &str = "a.test";
pub const REMOTE: &str = "b.test";
pub const ROOM: &str = "!room:a.test";
pub const ALICE: &str = "@alice:a.test";
pub const BOB: &str = "@bob:b.test";
pub const SEED: &str = "test-seed";

pub fn server(name: &str) -> ServerName {
    ServerName::parse(name).unwrap()
}

pub fn room_id() -> RoomId {
    RoomId::parse(ROOM).unwrap()
}

pub fn keyring() -> LocalKeyring {
    LocalKeyring::new()
        .with_derived(server(LOCAL), SEED)
        .with_derived(server(REMOTE), SEED)
}

/// Config for the local server with no idle waiting on missing prev events.
pub fn config() -> NodeConfig {
    let mut cfg = NodeConfig::default().with_server_name(server(LOCAL));
    cfg.key_seed = SEED.to_string();
    cfg.vm.fetch_prev_wait_count = 0;
    cfg.vm.fetch_prev_check_interval = Duration::from_millis(20);
    cfg.vm.fetch_event_timeout = Duration::from_secs(2);
    cfg.vm.fetch_auth_timeout = Duration::from_secs(2);
    cfg.vm.fetch_state_timeout = Duration::from_secs(2);
    cfg.fetch.timeout = Duration::from_secs(1);
    cfg.fetch.timeout_auth = None;
    cfg
}

pub struct Harness {
    pub vm: Arc<Vm>,
    pub store: Arc<Store>,
    pub transport: Arc<MockTransport>,
}

/// An engine over `store`, for tests that observe or disturb commits.
pub fn vm_on(cfg: NodeConfig, store: Arc<InstrumentedStore>, transport: MockTransport) -> Arc<Vm> {
    Vm::builder(cfg)
        .storage(store)
        .keyring(Arc::new(keyring()))
        .transport(Arc::new(transport))
        .build()
}

pub fn harness(cfg: NodeConfig, transport: MockTransport) -> Harness {
    let store = Arc::new(Store::memory());
    let transport = Arc::new(transport);
    let vm = Vm::builder(cfg)
        .storage(store.clone())
        .keyring(Arc::new(keyring()))
        .transport(transport.clone())
        .build();
    Harness { vm, store, transport }
}

/// The local room: a create event and alice's join, both issued locally.
pub struct Room {
    pub create: Event,
    pub join: Event,
}

pub async fn local_room(vm: &Vm) -> Room {
    let create = vm
        .inject(
            json!({"room_id": ROOM, "type": "m.room.create", "state_key": "", "sender": ALICE}),
            json!({"creator": ALICE}),
            Copts::default(),
        )
        .await
        .unwrap();
    assert!(create.fault.is_accept(), "create: {:?}", create.fault);

    let join = vm
        .inject(
            json!({"room_id": ROOM, "type": "m.room.member", "state_key": ALICE, "sender": ALICE}),
            json!({"membership": "join"}),
            Copts::default(),
        )
        .await
        .unwrap();
    assert!(join.fault.is_accept(), "join: {:?}", join.fault);

    Room {
        create: create.event,
        join: join.event,
    }
}

pub fn id(event: &Event) -> EventId {
    event.event_id().cloned().unwrap()
}

/// A PDU from the remote server, sealed with its key.
pub fn remote_event(kind: &str, sender: &str, state_key: Option<&str>, content: Value, prev: &[&Event], auth: &[&Event]) -> Event {
    let depth = prev.iter().map(|e| e.depth()).max().unwrap_or(0) + 1;
    let mut source = json!({
        "room_id": ROOM,
        "type": kind,
        "sender": sender,
        "origin": REMOTE,
        "origin_server_ts": 1_700_000_000_000i64 + depth,
        "depth": depth,
        "prev_events": prev.iter().map(|e| id(e).to_string()).collect::<Vec<_>>(),
        "auth_events": auth.iter().map(|e| id(e).to_string()).collect::<Vec<_>>(),
        "content": content,
    });
    if let Some(key) = state_key {
        source["state_key"] = json!(key);
    }
    seal(source, &keyring(), &server(REMOTE), IdFormat::Hashed).unwrap()
}

/// Bob joins from the remote server.
pub fn bob_join(room: &Room) -> Event {
    remote_event(
        "m.room.member",
        BOB,
        Some(BOB),
        json!({"membership": "join"}),
        &[&room.join],
        &[&room.create],
    )
}

pub fn bob_message(body: &str, prev: &Event, room: &Room) -> Event {
    remote_event(
        "m.room.message",
        BOB,
        None,
        json!({"msgtype": "m.text", "body": body}),
        &[prev],
        &[&room.create],
    )
}

/// Answers federation requests from a store of its own and records every
/// request it receives.
pub struct MockTransport {
    source: Store,
    calls: Mutex<Vec<(ServerName, &'static str)>>,
    errant: HashSet<ServerName>,
    stalled: HashSet<ServerName>,
    latency: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            source: Store::memory(),
            calls: Mutex::new(Vec::new()),
            errant: HashSet::new(),
            stalled: HashSet::new(),
            latency: Duration::ZERO,
        }
    }

    /// Make `events` available to every remote. Call once.
    pub fn serve(&self, events: &[Event]) {
        fixtures::load(&self.source, events).unwrap();
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_errant(mut self, remote: &str) -> Self {
        self.errant.insert(server(remote));
        self
    }

    /// `remote` accepts requests and never answers.
    pub fn with_stall(mut self, remote: &str) -> Self {
        self.stalled.insert(server(remote));
        self
    }

    pub fn calls(&self) -> Vec<(ServerName, &'static str)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

fn not_found(id: &EventId) -> TransportError {
    TransportError::Http {
        status: 404,
        message: format!("{id} not found"),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, remote: &ServerName, request: FedRequest) -> Result<Value, TransportError> {
        self.calls.lock().push((remote.clone(), request.name()));
        if self.stalled.contains(remote) {
            std::future::pending::<()>().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let sources = |events: Vec<Event>| events.iter().map(|e| e.source().clone()).collect::<Vec<_>>();
        match request {
            FedRequest::Event { event_id } => {
                let event = self
                    .source
                    .get_event(&event_id)
                    .map_err(|e| TransportError::Decode(e.to_string()))?
                    .ok_or_else(|| not_found(&event_id))?;
                Ok(json!({"origin": remote.as_str(), "origin_server_ts": 0, "pdus": [event.source()]}))
            }
            FedRequest::EventAuth { event_id, .. } => {
                if !self.source.exists(&event_id) {
                    return Err(not_found(&event_id));
                }
                let chain = self
                    .source
                    .auth_chain(&event_id)
                    .map_err(|e| TransportError::Decode(e.to_string()))?;
                Ok(json!({"auth_chain": sources(chain)}))
            }
            FedRequest::Backfill { room_id, event_id, limit } => {
                if !self.source.exists(&event_id) {
                    return Err(not_found(&event_id));
                }
                let events = self
                    .source
                    .backfill(&room_id, &event_id, limit)
                    .map_err(|e| TransportError::Decode(e.to_string()))?;
                Ok(json!({"origin": remote.as_str(), "pdus": sources(events)}))
            }
        }
    }

    fn errant(&self, remote: &ServerName) -> bool {
        self.errant.contains(remote)
    }
}

/// A store that records the order of its commits and can refuse them or
/// cancel an evaluation right after one lands.
pub struct InstrumentedStore {
    pub inner: Store,
    fail: AtomicUsize,
    pub failed: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    commits: Mutex<Vec<u64>>,
}

impl InstrumentedStore {
    pub fn new() -> Self {
        Self {
            inner: Store::memory(),
            fail: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            cancel: Mutex::new(None),
            commits: Mutex::new(Vec::new()),
        }
    }

    /// Refuse the next `n` commits.
    pub fn fail_next(&self, n: usize) {
        self.fail.store(n, Ordering::Release);
    }

    /// Fire `token` once the next commit is durable.
    pub fn cancel_after_commit(&self, token: CancellationToken) {
        *self.cancel.lock() = Some(token);
    }

    /// Highest event index after each commit, in commit order.
    pub fn commits(&self) -> Vec<u64> {
        self.commits.lock().clone()
    }
}

impl Storage for InstrumentedStore {
    fn commit(&self, batch: Batch) -> StorageResult<u64> {
        let left = self.fail.load(Ordering::Acquire);
        if left > 0 {
            self.fail.store(left - 1, Ordering::Release);
            self.failed.store(true, Ordering::Release);
            return Err(PersistenceError::InvalidFormat("injected commit failure".into()));
        }
        let batches = {
            let mut commits = self.commits.lock();
            let batches = self.inner.write(batch)?;
            commits.push(self.inner.last_sequence());
            batches
        };
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        Ok(batches)
    }

    fn exists(&self, event_id: &EventId) -> bool {
        self.inner.exists(event_id)
    }

    fn get_event(&self, event_id: &EventId) -> StorageResult<Option<Event>> {
        self.inner.get_event(event_id)
    }

    fn room_depth(&self, room_id: &RoomId) -> Option<i64> {
        self.inner.room_depth(room_id)
    }

    fn room_head(&self, room_id: &RoomId, limit: usize) -> Vec<HeadEntry> {
        self.inner.room_head(room_id, limit)
    }

    fn state_event(&self, room_id: &RoomId, kind: &str, state_key: &str) -> StorageResult<Option<Event>> {
        self.inner.state_event(room_id, kind, state_key)
    }

    fn room_version(&self, room_id: &RoomId) -> StorageResult<Option<String>> {
        self.inner.room_version(room_id)
    }

    fn room_servers(&self, room_id: &RoomId) -> Vec<ServerName> {
        self.inner.room_servers(room_id)
    }

    fn local_joined(&self, room_id: &RoomId, server: &ServerName) -> bool {
        self.inner.local_joined(room_id, server)
    }

    fn backfill(&self, room_id: &RoomId, from: &EventId, limit: usize) -> StorageResult<Vec<Event>> {
        self.inner.backfill(room_id, from, limit)
    }

    fn auth_chain(&self, event_id: &EventId) -> StorageResult<Vec<Event>> {
        self.inner.auth_chain(event_id)
    }

    fn last_sequence(&self) -> u64 {
        self.inner.last_sequence()
    }
}

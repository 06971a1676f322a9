// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The event evaluation engine.
//!
//! `Vm` owns the collaborators (storage, keyring, authority, transport) and
//! the shared machinery (sequencer, hook pipeline, fetcher). Evaluations run
//! on the caller's task; any number may be in flight at once and the
//! sequencer serializes their commits.

pub mod authority;
pub mod conform;
pub mod eval;
pub mod execute;
pub mod fault;
pub mod fetch;
pub mod hook;
pub mod inject;
pub mod opts;
pub mod phase;
pub mod registry;
pub mod sequence;
pub mod txn;

pub use authority::{Authority, Permissive, Structural};
pub use eval::Eval;
pub use fault::{Fault, FaultMask, VmError};
pub use hook::{Hook, Pipeline, Stage};
pub use inject::Issued;
pub use opts::{Copts, Opts, PropMask};
pub use phase::{Phase, PhaseMask};
pub use sequence::{Counters, Sequencer};
pub use txn::Notice;

use crate::config::NodeConfig;
use crate::fetch::Fetcher;
use crate::network::{FederationClient, Transport};
use crate::storage::Storage;
use hsvm_kernel::{Event, Keyring, LocalKeyring, ServerName};
use hsvm_persistence::Store;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const NOTIFY_CAPACITY: usize = 1024;

pub struct Vm {
    pub(crate) cfg: NodeConfig,
    pub(crate) store: Arc<dyn Storage>,
    pub(crate) keyring: Arc<dyn Keyring>,
    pub(crate) authority: Arc<dyn Authority>,
    pub(crate) seq: Arc<Sequencer>,
    pub(crate) hooks: Pipeline,
    pub(crate) fetcher: Fetcher,
    notify_tx: broadcast::Sender<Event>,
    outbound_tx: broadcast::Sender<Event>,
    executing: AtomicUsize,
    injecting: AtomicUsize,
}

pub struct VmBuilder {
    cfg: NodeConfig,
    store: Option<Arc<dyn Storage>>,
    keyring: Option<Arc<dyn Keyring>>,
    transport: Option<Arc<dyn Transport>>,
    authority: Option<Arc<dyn Authority>>,
}

impl VmBuilder {
    pub fn storage(mut self, store: Arc<dyn Storage>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn keyring(mut self, keyring: Arc<dyn Keyring>) -> Self {
        self.keyring = Some(keyring);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn authority(mut self, authority: Arc<dyn Authority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Assemble the engine. Spawns the fetch worker, so it must be called
    /// within a tokio runtime.
    pub fn build(self) -> Arc<Vm> {
        let cfg = self.cfg;
        let store = self.store.unwrap_or_else(|| Arc::new(Store::memory()));
        let keyring = self.keyring.unwrap_or_else(|| Arc::new(default_keyring(&cfg)));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(FederationClient::new(cfg.peers.clone(), cfg.errant_backoff)));
        let authority = self.authority.unwrap_or_else(|| Arc::new(Permissive));

        let fetcher = Fetcher::new(
            cfg.fetch.clone(),
            cfg.server_name.clone(),
            store.clone(),
            keyring.clone(),
            transport,
        );

        let hooks = Pipeline::default();
        hooks.register(Stage::Conform, Arc::new(conform::ConformHook));
        hooks.register(Stage::Fetch, Arc::new(fetch::FetchHook));

        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let vm = Vm {
            seq: Arc::new(Sequencer::new(store.last_sequence())),
            cfg,
            store,
            keyring,
            authority,
            hooks,
            fetcher,
            notify_tx,
            outbound_tx,
            executing: AtomicUsize::new(0),
            injecting: AtomicUsize::new(0),
        };
        vm.init();
        Arc::new(vm)
    }
}

/// Keys for this server and every configured peer, derived from the shared
/// seed.
pub fn default_keyring(cfg: &NodeConfig) -> LocalKeyring {
    let mut keyring = LocalKeyring::new().with_derived(cfg.server_name.clone(), &cfg.key_seed);
    for peer in cfg.peers.keys() {
        keyring = keyring.with_derived(peer.clone(), &cfg.key_seed);
    }
    keyring
}

impl Vm {
    pub fn builder(cfg: NodeConfig) -> VmBuilder {
        VmBuilder {
            cfg,
            store: None,
            keyring: None,
            transport: None,
            authority: None,
        }
    }

    /// Seed the counters from the database and announce the engine.
    pub fn init(&self) {
        let last = self.store.last_sequence();
        self.seq.seed(last);
        info!(
            "BOOT {} vm:{}:{}:{} hooks conform:{} fetch:{}",
            self.cfg.server_name,
            last,
            last,
            last,
            self.hooks.count(Stage::Conform),
            self.hooks.count(Stage::Fetch),
        );
    }

    /// Wait for executing and injecting evaluations to drain.
    pub async fn fini(&self) {
        let cancel = CancellationToken::new();
        let _ = self
            .seq
            .wait_until(&cancel, |_, _| {
                self.executing.load(Ordering::Acquire) == 0 && self.injecting.load(Ordering::Acquire) == 0
            })
            .await;
        let c = self.seq.counters();
        info!("HLT {} vm:{}:{}:{}", self.cfg.server_name, c.retired, c.committed, c.uncommitted);
    }

    pub fn server_name(&self) -> &ServerName {
        &self.cfg.server_name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn keyring(&self) -> &Arc<dyn Keyring> {
        &self.keyring
    }

    pub fn hooks(&self) -> &Pipeline {
        &self.hooks
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn counters(&self) -> Counters {
        self.seq.counters()
    }

    /// Evaluations currently registered.
    pub fn live(&self) -> usize {
        self.seq.live()
    }

    /// Accepted events, in the order they were notified.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.notify_tx.subscribe()
    }

    /// Local events accepted for delivery to the other servers in the room.
    pub fn subscribe_outbound(&self) -> broadcast::Receiver<Event> {
        self.outbound_tx.subscribe()
    }

    /// Deliver a notice on the channels it asks for. No subscribers is not an
    /// error.
    pub(crate) fn deliver(&self, notice: Notice) {
        if notice.servers {
            let _ = self.outbound_tx.send(notice.event.clone());
        }
        if !notice.clients {
            return;
        }
        let event = match &notice.client_txnid {
            Some(txnid) => match notice.event.with_unsigned("transaction_id", txnid.as_str().into()) {
                Ok(event) => event,
                Err(e) => {
                    warn!("client txnid for {} not attached: {}", notice.event.pretty_oneline(), e);
                    notice.event
                }
            },
            None => notice.event,
        };
        let _ = self.notify_tx.send(event);
    }
}

/// Counts an activity for `fini` while alive.
pub(crate) struct Activity<'a> {
    counter: &'a AtomicUsize,
    seq: &'a Sequencer,
}

impl<'a> Activity<'a> {
    fn new(counter: &'a AtomicUsize, seq: &'a Sequencer) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter, seq }
    }
}

impl Drop for Activity<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        self.seq.notify();
    }
}

impl Vm {
    pub(crate) fn executing(&self) -> Activity<'_> {
        Activity::new(&self.executing, &self.seq)
    }

    pub(crate) fn injecting(&self) -> Activity<'_> {
        Activity::new(&self.injecting, &self.seq)
    }
}

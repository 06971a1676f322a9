// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Dependency fetcher.
//!
//! Requests are deduplicated by `(op, room, event)`: a second caller for the
//! same key joins the first request's waiters and receives the same outcome.
//! A single worker task drives every attempt; see `worker`.

mod check;
mod request;
mod worker;

use crate::config::FetchConfig;
use crate::network::Transport;
use crate::storage::Storage;
use hsvm_kernel::{Event, EventId, Keyring, RoomId, ServerName};
use parking_lot::Mutex;
use request::{Key, Launch, Request};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Event,
    Auth,
    Backfill,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::Event => "event",
            Op::Auth => "auth",
            Op::Backfill => "backfill",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FetchOpts {
    pub op: Op,
    pub room_id: RoomId,
    pub event_id: EventId,
    /// Remote to try first.
    pub hint: Option<ServerName>,
    /// Remotes tried before giving up; zero is unlimited.
    pub attempt_limit: usize,
    /// Events requested by a backfill; zero takes the configured default.
    pub backfill_limit: usize,
    /// Per-attempt timeout; `None` takes the configured one for the op.
    pub timeout: Option<Duration>,
    pub check_event_id: bool,
    pub check_conforms: bool,
    pub check_hashes: bool,
    pub authoritative_redaction: bool,
    pub check_signature: bool,
}

impl FetchOpts {
    pub fn new(op: Op, room_id: RoomId, event_id: EventId, cfg: &FetchConfig) -> Self {
        Self {
            op,
            room_id,
            event_id,
            hint: None,
            attempt_limit: cfg.attempt_limit,
            backfill_limit: 0,
            timeout: None,
            check_event_id: cfg.check_event_id,
            check_conforms: cfg.check_conforms,
            check_hashes: cfg.check_hashes,
            authoritative_redaction: cfg.authoritative_redaction,
            check_signature: cfg.check_signature,
        }
    }

    pub fn with_hint(mut self, hint: Option<ServerName>) -> Self {
        self.hint = hint;
        self
    }
}

/// A validated response.
#[derive(Clone, Debug)]
pub struct FetchResult {
    /// Remote that answered.
    pub origin: ServerName,
    pub pdus: Arc<Vec<Event>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("{} {event_id} not found after {attempts} attempts: {reason}", .op.name())]
    NotFound {
        op: Op,
        event_id: EventId,
        attempts: usize,
        reason: String,
    },
    #[error("fetching is disabled")]
    Disabled,
    #[error("fetcher shut down")]
    Shutdown,
}

/// Resolves to the outcome of a request.
pub struct FetchHandle {
    rx: oneshot::Receiver<Result<FetchResult, FetchError>>,
}

impl Future for FetchHandle {
    type Output = Result<FetchResult, FetchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(FetchError::Shutdown)))
    }
}

pub(crate) struct Shared {
    cfg: FetchConfig,
    my: ServerName,
    store: Arc<dyn Storage>,
    keyring: Arc<dyn Keyring>,
    transport: Arc<dyn Transport>,
    requests: Mutex<BTreeMap<Key, Request>>,
    attempts: AtomicU64,
    dock: Notify,
}

impl Shared {
    fn timeout(&self, opts: &FetchOpts) -> Duration {
        let per_op = match opts.op {
            Op::Event => self.cfg.timeout_event,
            Op::Auth => self.cfg.timeout_auth,
            Op::Backfill => self.cfg.timeout_backfill,
        };
        opts.timeout.or(per_op).unwrap_or(self.cfg.timeout)
    }

    /// Pick the next remote for `req` and describe the attempt, or `None`
    /// when every candidate is exhausted.
    fn next_attempt(&self, req: &mut Request) -> Option<Launch> {
        let remote = req.select(&self.my, &*self.store, &*self.transport)?;
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = self.timeout(&req.opts);
        metrics::counter!("hsvm_fetch_attempts_total", 1, "op" => req.opts.op.name());
        Some(req.launch(remote, attempt, timeout, self.cfg.backfill_limit_default))
    }

    fn update_gauge(&self, len: usize) {
        metrics::gauge!("hsvm_fetch_inflight", len as f64);
    }
}

pub struct Fetcher {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Launch>,
}

impl Fetcher {
    /// Create the fetcher and spawn its worker onto the current runtime.
    pub fn new(
        cfg: FetchConfig,
        my: ServerName,
        store: Arc<dyn Storage>,
        keyring: Arc<dyn Keyring>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let shared = Arc::new(Shared {
            cfg,
            my,
            store,
            keyring,
            transport,
            requests: Mutex::new(BTreeMap::new()),
            attempts: AtomicU64::new(0),
            dock: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker::run(shared.clone(), rx));
        Self { shared, tx }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.shared.cfg
    }

    /// Start or join a request. Parks while the fetcher is at capacity.
    pub async fn start(&self, opts: FetchOpts) -> Result<FetchHandle, FetchError> {
        if !self.shared.cfg.enable {
            return Err(FetchError::Disabled);
        }

        let key: Key = (opts.op, opts.room_id.clone(), opts.event_id.clone());
        let (tx, rx) = oneshot::channel();
        let handle = FetchHandle { rx };
        let mut waiter = Some(tx);

        let launch = loop {
            let notified = self.shared.dock.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut requests = self.shared.requests.lock();
                if let Some(req) = requests.get_mut(&key) {
                    if let Some(tx) = waiter.take() {
                        req.waiters.push(tx);
                    }
                    tracing::debug!("fetch {} {} joined in flight request", opts.op.name(), opts.event_id);
                    return Ok(handle);
                }
                if requests.len() < self.shared.cfg.requests_max {
                    let Some(tx) = waiter.take() else {
                        return Err(FetchError::Shutdown);
                    };
                    let mut req = Request::new(opts.clone(), tx);
                    metrics::counter!("hsvm_fetch_requests_total", 1, "op" => opts.op.name());
                    match self.shared.next_attempt(&mut req) {
                        Some(launch) => {
                            requests.insert(key.clone(), req);
                            self.shared.update_gauge(requests.len());
                            break launch;
                        }
                        None => {
                            tracing::debug!(
                                "fetch {} {} in {}: no remote to ask",
                                opts.op.name(),
                                opts.event_id,
                                opts.room_id
                            );
                            let err = req.not_found();
                            req.finish(Err(err));
                            return Ok(handle);
                        }
                    }
                }
            }
            notified.await;
        };

        self.tx.send(launch).map_err(|_| FetchError::Shutdown)?;
        Ok(handle)
    }

    /// Requests in flight.
    pub fn count(&self) -> usize {
        self.shared.requests.lock().len()
    }

    pub fn exists(&self, op: Op, room_id: &RoomId, event_id: &EventId) -> bool {
        self.shared
            .requests
            .lock()
            .contains_key(&(op, room_id.clone(), event_id.clone()))
    }
}

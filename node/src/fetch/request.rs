// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Request state and remote selection.

use super::{FetchError, FetchOpts, FetchResult, Op};
use crate::network::{FedRequest, Transport};
use crate::storage::Storage;
use hsvm_kernel::{EventId, RoomId, ServerName};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub(crate) type Key = (Op, RoomId, EventId);
pub(crate) type Waiter = oneshot::Sender<Result<FetchResult, FetchError>>;

/// An attempt handed to the worker.
#[derive(Debug)]
pub(crate) struct Launch {
    pub key: Key,
    pub attempt: u64,
    pub remote: ServerName,
    pub request: FedRequest,
    pub timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Request {
    pub opts: FetchOpts,
    pub started: Instant,
    pub last: Instant,
    pub attempted: BTreeSet<ServerName>,
    /// Remote of the attempt in flight.
    pub origin: Option<ServerName>,
    /// Identifies the attempt in flight; completions of any other are stale.
    pub attempt: u64,
    pub waiters: Vec<Waiter>,
    pub last_error: Option<String>,
}

impl Request {
    pub fn new(opts: FetchOpts, waiter: Waiter) -> Self {
        let now = Instant::now();
        Self {
            opts,
            started: now,
            last: now,
            attempted: BTreeSet::new(),
            origin: None,
            attempt: 0,
            waiters: vec![waiter],
            last_error: None,
        }
    }

    pub fn key(&self) -> Key {
        (self.opts.op, self.opts.room_id.clone(), self.opts.event_id.clone())
    }

    /// Whether `remote` may be tried next.
    pub fn proffer(&self, remote: &ServerName, my: &ServerName, transport: &dyn Transport) -> bool {
        remote != my && !self.attempted.contains(remote) && !transport.errant(remote)
    }

    /// Next remote in preference order: the hint, the event id's origin, a
    /// random server joined to the room, then the room id's origin.
    pub fn select(&self, my: &ServerName, store: &dyn Storage, transport: &dyn Transport) -> Option<ServerName> {
        if self.opts.attempt_limit > 0 && self.attempted.len() >= self.opts.attempt_limit {
            return None;
        }

        let ok = |remote: &ServerName| self.proffer(remote, my, transport);

        if let Some(hint) = self.opts.hint.as_ref().filter(|h| ok(h)) {
            return Some(hint.clone());
        }
        if let Some(host) = self.opts.event_id.host().filter(|h| ok(h)) {
            return Some(host);
        }
        let joined: Vec<ServerName> = store
            .room_servers(&self.opts.room_id)
            .into_iter()
            .filter(|s| ok(s))
            .collect();
        if let Some(remote) = joined.choose(&mut rand::thread_rng()) {
            return Some(remote.clone());
        }
        self.opts.room_id.host().filter(|h| ok(h))
    }

    /// Record an attempt at `remote` and describe it for the worker.
    pub fn launch(&mut self, remote: ServerName, attempt: u64, timeout: Duration, backfill_default: usize) -> Launch {
        self.attempted.insert(remote.clone());
        self.origin = Some(remote.clone());
        self.attempt = attempt;
        self.last = Instant::now();
        let request = match self.opts.op {
            Op::Event => FedRequest::Event {
                event_id: self.opts.event_id.clone(),
            },
            Op::Auth => FedRequest::EventAuth {
                room_id: self.opts.room_id.clone(),
                event_id: self.opts.event_id.clone(),
            },
            Op::Backfill => FedRequest::Backfill {
                room_id: self.opts.room_id.clone(),
                event_id: self.opts.event_id.clone(),
                limit: match self.opts.backfill_limit {
                    0 => backfill_default,
                    n => n,
                },
            },
        };
        Launch {
            key: self.key(),
            attempt,
            remote,
            request,
            timeout,
        }
    }

    /// Resolve every waiter with `result`.
    pub fn finish(&mut self, result: Result<FetchResult, FetchError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn not_found(&self) -> FetchError {
        FetchError::NotFound {
            op: self.opts.op,
            event_id: self.opts.event_id.clone(),
            attempts: self.attempted.len(),
            reason: self.last_error.clone().unwrap_or_else(|| "no remote to ask".into()),
        }
    }

    /// Whether every waiter has gone away.
    pub fn abandoned(&self) -> bool {
        self.waiters.iter().all(|w| w.is_closed())
    }
}

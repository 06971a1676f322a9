// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The fetch worker.
//!
//! One task owns every in-flight attempt. Each loop iteration handles one of:
//! a newly launched attempt, one completed attempt, or a cleanup tick that
//! reaps requests nobody waits for. Completions for an attempt that is no
//! longer the request's current one are ignored.

use super::check;
use super::request::Launch;
use super::{FetchResult, Shared};
use crate::network::TransportError;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use hsvm_kernel::ServerName;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

struct Completion {
    key: super::request::Key,
    attempt: u64,
    remote: ServerName,
    result: Result<Value, TransportError>,
}

fn attempt(shared: &Arc<Shared>, launch: Launch) -> BoxFuture<'static, Completion> {
    let transport = shared.transport.clone();
    async move {
        let Launch {
            key,
            attempt,
            remote,
            request,
            timeout,
        } = launch;
        let result = match tokio::time::timeout(timeout, transport.send(&remote, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        Completion {
            key,
            attempt,
            remote,
            result,
        }
    }
    .boxed()
}

pub(crate) async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Launch>) {
    let mut inflight: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();
    let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);

    loop {
        tokio::select! {
            launch = rx.recv() => match launch {
                Some(launch) => inflight.push(attempt(&shared, launch)),
                None => break,
            },
            Some(done) = inflight.next(), if !inflight.is_empty() => {
                if let Some(next) = handle(&shared, done) {
                    inflight.push(attempt(&shared, next));
                }
            }
            _ = cleanup.tick() => reap(&shared),
        }
    }

    let mut requests = shared.requests.lock();
    for (_, mut req) in std::mem::take(&mut *requests) {
        req.finish(Err(super::FetchError::Shutdown));
    }
    debug!("fetch worker stopped");
}

/// Settle one completion. Returns the retry to launch, if any.
fn handle(shared: &Arc<Shared>, done: Completion) -> Option<Launch> {
    let mut requests = shared.requests.lock();
    let req = requests.get_mut(&done.key)?;
    if req.attempt != done.attempt {
        debug!("fetch {} {} stale completion from {}", done.key.0.name(), done.key.2, done.remote);
        return None;
    }
    req.last = Instant::now();

    let outcome = done
        .result
        .map_err(|e| e.to_string())
        .and_then(|body| check::response(&req.opts, &done.remote, body, &*shared.keyring));

    match outcome {
        Ok(pdus) => {
            debug!(
                "fetch {} {} from {} ok: {} pdus in {:?}",
                req.opts.op.name(),
                req.opts.event_id,
                done.remote,
                pdus.len(),
                req.started.elapsed()
            );
            req.finish(Ok(FetchResult {
                origin: done.remote,
                pdus: Arc::new(pdus),
            }));
            requests.remove(&done.key);
            shared.update_gauge(requests.len());
            drop(requests);
            shared.dock.notify_waiters();
            return None;
        }
        Err(e) => {
            warn!("fetch {} {} from {} failed: {}", req.opts.op.name(), req.opts.event_id, done.remote, e);
            req.last_error = Some(e);
        }
    }

    if req.abandoned() {
        requests.remove(&done.key);
    } else if let Some(next) = shared.next_attempt(req) {
        return Some(next);
    } else {
        let err = req.not_found();
        debug!("{}", err);
        req.finish(Err(err));
        requests.remove(&done.key);
    }
    shared.update_gauge(requests.len());
    drop(requests);
    shared.dock.notify_waiters();
    None
}

/// Drop requests whose callers have all gone away.
fn reap(shared: &Arc<Shared>) {
    let mut requests = shared.requests.lock();
    let before = requests.len();
    requests.retain(|_, req| !req.abandoned());
    if requests.len() != before {
        debug!("fetch reaped {} abandoned requests", before - requests.len());
        shared.update_gauge(requests.len());
        drop(requests);
        shared.dock.notify_waiters();
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Dependency resolution policies.
//!
//! Registered on the fetch stage and dispatched by phase:
//!
//! * FETCH_AUTH: when any auth event is missing, fetch the event's auth chain
//!   and evaluate it first. Failure faults AUTH.
//! * FETCH_PREV: wait briefly for missing prev events to arrive on their own,
//!   then backfill from remotes, evaluating whatever arrives. The Options
//!   decide whether a prev event still missing afterwards faults EVENT.
//! * FETCH_STATE: when the event's position in the graph is disconnected from
//!   ours, acquire the state it references. Failure faults STATE.

use super::eval::Eval;
use super::fault::{Fault, FaultMask, VmError};
use super::hook::Hook;
use super::opts::Opts;
use super::phase::{Phase, PhaseMask};
use super::Vm;
use crate::fetch::{FetchHandle, FetchOpts, FetchResult, Op};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use hsvm_kernel::{Event, EventId, ServerName};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

pub struct FetchHook;

#[async_trait]
impl Hook for FetchHook {
    fn name(&self) -> &str {
        "fetch"
    }

    fn matches(&self, event: &Event) -> bool {
        !event.is_edu() && !event.is_create()
    }

    async fn handle(&self, vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        match eval.phase {
            Phase::FetchAuth => auth(vm, eval, event).await,
            Phase::FetchPrev => prev(vm, eval, event).await,
            Phase::FetchState => state(vm, eval, event).await,
            _ => Ok(()),
        }
    }
}

async fn auth(vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
    let ids = event.auth_events();
    let present = vm.store.count_present(ids);
    if present == ids.len() {
        return Ok(());
    }

    let missing = ids.len() - present;
    if !vm.cfg.vm.fetch_enable {
        return Err(VmError::new(
            Fault::Auth,
            format!("Missing {} of {} auth_events; fetching is disabled", missing, ids.len()),
        ));
    }

    info!("{} fetching auth chain for {} missing auth_events", eval.loghead(), missing);
    if let Err(e) = auth_chain(vm, eval, event, vm.cfg.vm.fetch_auth_timeout).await {
        return Err(match e.code {
            Fault::Interrupt => e,
            _ => VmError::new(
                Fault::Auth,
                format!("Failed to fetch {} of {} auth_events :{}", missing, ids.len(), e.message),
            ),
        });
    }

    let still = ids.len() - vm.store.count_present(ids);
    if still > 0 {
        return Err(VmError::new(
            Fault::Auth,
            format!("Missing {} of {} auth_events after fetching the auth chain", still, ids.len()),
        ));
    }
    Ok(())
}

/// Fetch the auth chain of `event` and evaluate it as a child batch.
async fn auth_chain(vm: &Vm, eval: &mut Eval, event: &Event, timeout: Duration) -> Result<(), VmError> {
    let (Some(room_id), Some(event_id)) = (event.room_id(), event.event_id()) else {
        return Ok(());
    };
    let opts = FetchOpts::new(Op::Auth, room_id.clone(), event_id.clone(), vm.fetcher.config())
        .with_hint(hint(vm, eval, event, None));
    let handle = start(vm, opts).await?;
    let result = race(eval, handle, timeout).await?;

    debug!(
        "{} evaluating auth chain of {} events from {}",
        eval.loghead(),
        result.pdus.len(),
        result.origin
    );
    let child = Opts {
        fetch: false,
        warnlog: eval.opts.warnlog - FaultMask::EXISTS,
        notify_servers: false,
        node_id: Some(result.origin.clone()),
        infolog_accept: true,
        ..(*eval.opts).clone()
    };
    vm.execute_child(eval, result.pdus.to_vec(), child).await?;
    Ok(())
}

async fn prev(vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
    let ids = event.prev_events();
    if vm.store.count_present(ids) == ids.len() {
        return Ok(());
    }

    if prev_wait(vm, eval, event).await? {
        return Ok(());
    }

    if vm.cfg.vm.fetch_enable {
        let handles = prev_fetch(vm, eval, event).await?;
        if !handles.is_empty() {
            let results = prev_race(vm, eval, event, handles).await?;
            prev_eval(vm, eval, results).await?;
        }
    }

    prev_check(vm, eval, event)
}

/// Wait for missing prev events to arrive by other means. Returns whether
/// they all did.
async fn prev_wait(vm: &Vm, eval: &Eval, event: &Event) -> Result<bool, VmError> {
    let ids = event.prev_events();
    let count = eval.opts.fetch_prev_wait_count.unwrap_or(vm.cfg.vm.fetch_prev_wait_count);
    let time = eval.opts.fetch_prev_wait_time.unwrap_or(vm.cfg.vm.fetch_prev_wait_time);
    for i in 1..=count {
        let deadline = Instant::now() + time * i as u32;
        while Instant::now() < deadline {
            vm.seq.dock_wait(deadline - Instant::now(), &eval.cancel).await?;
            if vm.store.count_present(ids) == ids.len() {
                debug!("{} prev_events arrived while waiting", eval.loghead());
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Start a backfill for each missing prev event.
async fn prev_fetch(vm: &Vm, eval: &Eval, event: &Event) -> Result<Vec<FetchHandle>, VmError> {
    let Some(room_id) = event.room_id() else {
        return Ok(Vec::new());
    };
    let room_depth = vm.store.room_depth(room_id).unwrap_or(0);
    let gap = event.depth().saturating_sub(room_depth).unsigned_abs().max(1) as usize;
    let limit = gap
        .min(eval.opts.fetch_prev_limit.unwrap_or(usize::MAX))
        .min(vm.cfg.vm.fetch_prev_backfill_limit);

    let mut handles = Vec::new();
    for prev_id in event.prev_events().iter().filter(|id| !vm.store.exists(id)) {
        let mut opts = FetchOpts::new(Op::Backfill, room_id.clone(), prev_id.clone(), vm.fetcher.config())
            .with_hint(hint(vm, eval, event, Some(prev_id)));
        opts.backfill_limit = limit;
        debug!(
            "{} backfilling {} events before {} (room depth {})",
            eval.loghead(),
            limit,
            prev_id,
            room_depth
        );
        match start(vm, opts).await {
            Ok(handle) => handles.push(handle),
            Err(e) if e.code == Fault::Interrupt => return Err(e),
            Err(e) => warn!("{} backfill of {} not started :{}", eval.loghead(), prev_id, e.message),
        }
    }
    Ok(handles)
}

/// Collect backfill results until every request settles, the prev events
/// arrive independently, or the deadline passes.
async fn prev_race(vm: &Vm, eval: &Eval, event: &Event, handles: Vec<FetchHandle>) -> Result<Vec<FetchResult>, VmError> {
    let ids = event.prev_events();
    let deadline = Instant::now() + vm.cfg.vm.fetch_event_timeout;
    let period = vm.cfg.vm.fetch_prev_check_interval;
    let mut check = tokio::time::interval_at(Instant::now() + period, period);
    let mut pending: FuturesUnordered<FetchHandle> = handles.into_iter().collect();
    let mut results = Vec::new();

    while !pending.is_empty() {
        tokio::select! {
            Some(outcome) = pending.next() => match outcome {
                Ok(result) => results.push(result),
                Err(e) => debug!("{} backfill failed :{}", eval.loghead(), e),
            },
            _ = check.tick() => {
                if vm.store.count_present(ids) == ids.len() {
                    debug!("{} prev_events arrived during backfill", eval.loghead());
                    break;
                }
            }
            _ = sleep_until(deadline) => {
                warn!("{} backfill timed out with {} requests pending", eval.loghead(), pending.len());
                break;
            }
            _ = eval.cancel.cancelled() => return Err(VmError::interrupt()),
        }
    }
    Ok(results)
}

async fn prev_eval(vm: &Vm, eval: &mut Eval, results: Vec<FetchResult>) -> Result<(), VmError> {
    for result in results {
        debug!(
            "{} evaluating {} backfilled events from {}",
            eval.loghead(),
            result.pdus.len(),
            result.origin
        );
        let child = Opts {
            phase: eval.opts.phase - (PhaseMask::FETCH_PREV | PhaseMask::FETCH_STATE),
            notify_servers: false,
            node_id: Some(result.origin.clone()),
            fetch_prev_any: false,
            fetch_prev_all: false,
            ..(*eval.opts).clone()
        };
        match vm.execute_child(eval, result.pdus.to_vec(), child).await {
            Ok(_) => {}
            Err(e) if e.code == Fault::Interrupt => return Err(e),
            Err(e) => warn!("{} backfilled events :{}", eval.loghead(), e),
        }
    }
    Ok(())
}

fn prev_check(vm: &Vm, eval: &Eval, event: &Event) -> Result<(), VmError> {
    let ids = event.prev_events();
    let present = vm.store.count_present(ids);
    if eval.opts.fetch_prev_all && present < ids.len() {
        return Err(VmError::new(
            Fault::Event,
            format!("Missing {} of {} required prev_events", ids.len() - present, ids.len()),
        ));
    }
    if eval.opts.fetch_prev_any && present == 0 {
        return Err(VmError::new(
            Fault::Event,
            format!("Missing all {} prev_events; at least one is required", ids.len()),
        ));
    }
    if present < ids.len() {
        debug!("{} proceeding with {} of {} prev_events", eval.loghead(), present, ids.len());
    }
    Ok(())
}

async fn state(vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
    let ids = event.prev_events();
    let present = vm.store.count_present(ids);
    if eval.opts.fetch_state_any {
        if present == ids.len() {
            return Ok(());
        }
    } else if present > 0 {
        return Ok(());
    }

    if !eval.opts.fetch_state_shallow {
        if let Some(room_depth) = event.room_id().and_then(|r| vm.store.room_depth(r)) {
            if event.depth() > room_depth {
                return Ok(());
            }
        }
    }

    if !vm.cfg.vm.fetch_enable {
        return Err(VmError::new(
            Fault::State,
            "Missing state at the event; fetching is disabled",
        ));
    }

    info!("{} fetching possible missing state", eval.loghead());
    auth_chain(vm, eval, event, vm.cfg.vm.fetch_state_timeout)
        .await
        .map_err(|e| match e.code {
            Fault::Interrupt => e,
            _ => VmError::new(Fault::State, format!("Failed to acquire state :{}", e.message)),
        })
}

async fn start(vm: &Vm, opts: FetchOpts) -> Result<FetchHandle, VmError> {
    vm.fetcher
        .start(opts)
        .await
        .map_err(|e| VmError::new(Fault::General, e.to_string()))
}

/// Await `handle` against the timeout and the evaluation's cancellation.
async fn race(eval: &Eval, handle: FetchHandle, timeout: Duration) -> Result<FetchResult, VmError> {
    tokio::select! {
        outcome = tokio::time::timeout(timeout, handle) => match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(VmError::new(Fault::General, e.to_string())),
            Err(_) => Err(VmError::new(Fault::General, format!("timed out after {:?}", timeout))),
        },
        _ = eval.cancel.cancelled() => Err(VmError::interrupt()),
    }
}

/// First remote to ask: where the event came from, the prev event's origin,
/// the event's origin, then the room's.
fn hint(vm: &Vm, eval: &Eval, event: &Event, prev: Option<&EventId>) -> Option<ServerName> {
    let my = &vm.cfg.server_name;
    let candidates = [
        eval.opts.node_id.clone(),
        prev.and_then(EventId::host),
        event.origin().cloned(),
        event.room_id().and_then(|r| r.host()),
    ];
    candidates.into_iter().flatten().find(|s| s != my)
}

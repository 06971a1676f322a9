// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sequence counters and the ordering protocol.
//!
//! Three counters describe the engine's progress:
//!
//! * `uncommitted`: highest sequence handed out,
//! * `committed`: highest sequence whose batch is durable,
//! * `retired`: highest sequence below which nothing is still in flight.
//!
//! `retired <= committed <= uncommitted` holds at every observation point.
//! An evaluation acquires a sequence, waits for its turn to commit (every
//! lower unit committed or vacated), writes, then waits for its turn to
//! retire. Both waits park on one `Notify` which is signalled whenever a unit
//! commits, retires or leaves the registry.

use super::fault::VmError;
use super::phase::Phase;
use super::registry::{EvalId, Registry, Slot};
use hsvm_kernel::EventId;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub retired: u64,
    pub committed: u64,
    pub uncommitted: u64,
}

#[derive(Debug, Default)]
struct State {
    counters: Counters,
    registry: Registry,
}

#[derive(Debug, Default)]
pub struct Sequencer {
    state: Mutex<State>,
    dock: Notify,
}

impl Sequencer {
    /// Counters resume from the last index in the database.
    pub fn new(start: u64) -> Self {
        Self {
            state: Mutex::new(State {
                counters: Counters {
                    retired: start,
                    committed: start,
                    uncommitted: start,
                },
                registry: Registry::default(),
            }),
            dock: Notify::new(),
        }
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().counters
    }

    /// Reset every counter; only meaningful before any evaluation starts.
    pub fn seed(&self, start: u64) {
        let mut st = self.state.lock();
        st.counters = Counters {
            retired: start,
            committed: start,
            uncommitted: start,
        };
    }

    pub fn live(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn register(&self, parent: Option<EvalId>) -> EvalId {
        self.state.lock().registry.insert(parent)
    }

    /// Remove a slot. A slot leaving with an uncommitted sequence vacates it
    /// so that nothing waits on it.
    pub fn unregister(&self, id: EvalId) {
        let slot = self.state.lock().registry.remove(id);
        if let Some(slot) = slot {
            if slot.sequence > 0 && !slot.committed && !slot.is_member() {
                debug!(eval = id, seq = slot.sequence, "vacated uncommitted sequence");
            }
        }
        self.notify();
    }

    pub fn update(&self, id: EvalId, f: impl FnOnce(&mut Slot)) {
        if let Some(slot) = self.state.lock().registry.get_mut(id) {
            f(slot);
        }
    }

    pub fn enter(&self, id: EvalId, phase: Phase) {
        self.update(id, |slot| slot.phase = phase);
    }

    /// Clear the slot between the events of a batch. An uncommitted sequence
    /// is vacated just as on unregister.
    pub fn reset(&self, id: EvalId) {
        let vacated = {
            let mut st = self.state.lock();
            match st.registry.get_mut(id) {
                Some(slot) => {
                    let vacated = slot.sequence > 0 && !slot.retired;
                    slot.clear();
                    vacated
                }
                None => false,
            }
        };
        if vacated {
            self.notify();
        }
    }

    pub fn with_registry<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        f(&self.state.lock().registry)
    }

    /// Take the next sequence for `id`. With `group`, the slot joins that
    /// unit's transaction when it is still open; the second value reports
    /// whether it did.
    pub fn acquire(&self, id: EvalId, group: Option<EvalId>) -> (u64, bool) {
        let mut st = self.state.lock();
        let c = st.counters;
        let seq = st.registry.seqmax().max(c.uncommitted).max(c.committed) + 1;
        st.counters.uncommitted = seq;

        let joined = match group.and_then(|g| st.registry.get_mut(g)) {
            Some(root) if !root.committed && root.sequence > 0 => {
                root.high_water = root.high_water.max(seq);
                true
            }
            _ => false,
        };

        if let Some(slot) = st.registry.get_mut(id) {
            slot.sequence = seq;
            if joined {
                slot.group = group;
            }
        }

        assert!(st.registry.sequnique(seq), "sequence {seq} handed out twice");
        (seq, joined)
    }

    /// Park until no lower unit is uncommitted.
    pub async fn await_commit_turn(&self, id: EvalId, cancel: &CancellationToken) -> Result<(), VmError> {
        self.wait_until(cancel, |reg, _| match reg.get(id) {
            Some(slot) => !reg.pending_commit_below(slot.sequence),
            None => true,
        })
        .await
    }

    /// Record that the unit owning `id` made its batch durable.
    pub fn mark_committed(&self, id: EvalId) -> Counters {
        let counters = {
            let mut st = self.state.lock();
            let Some(slot) = st.registry.get_mut(id) else {
                return st.counters;
            };
            slot.committed = true;
            let top = slot.sequence.max(slot.high_water);
            st.counters.committed = st.counters.committed.max(top);
            st.counters
        };
        self.notify();
        counters
    }

    /// Park until no lower unit is unretired.
    pub async fn await_retire_turn(&self, id: EvalId, cancel: &CancellationToken) -> Result<(), VmError> {
        self.wait_until(cancel, |reg, _| match reg.get(id) {
            Some(slot) => !reg.pending_retire_below(slot.sequence),
            None => true,
        })
        .await
    }

    /// Retire `id`, advancing `retired` as far as the committed prefix
    /// allows without passing a live unit. Called after the retire turn, so
    /// the result is never below the slot's own sequence.
    pub fn retire(&self, id: EvalId) -> Counters {
        let counters = {
            let mut st = self.state.lock();
            let cap = st
                .registry
                .lowest_unretired_except(id)
                .map(|s| s - 1)
                .unwrap_or(u64::MAX);
            let Some(slot) = st.registry.get_mut(id) else {
                return st.counters;
            };
            slot.retired = true;
            let own = slot.sequence;
            let c = &mut st.counters;
            let target = c.committed.min(cap);
            if own > c.committed {
                warn!(eval = id, seq = own, committed = c.committed, "retiring ahead of commit");
            }
            c.retired = c.retired.max(target);
            st.counters
        };
        self.notify();
        counters
    }

    /// Park until `pred` holds over the registry and counters. The predicate
    /// is evaluated under the lock and must not block.
    pub async fn wait_until<F>(&self, cancel: &CancellationToken, mut pred: F) -> Result<(), VmError>
    where
        F: FnMut(&Registry, &Counters) -> bool,
    {
        self.park(cancel, |st| pred(&st.registry, &st.counters)).await
    }

    /// Park until no other live evaluation holds `event_id`, then publish it
    /// on `id`'s slot in the same critical section.
    pub async fn claim_event(&self, id: EvalId, event_id: &EventId, cancel: &CancellationToken) -> Result<(), VmError> {
        self.park(cancel, |st| {
            if st.registry.count_event(event_id, id) > 0 {
                return false;
            }
            if let Some(slot) = st.registry.get_mut(id) {
                slot.event_id = Some(event_id.clone());
            }
            true
        })
        .await
    }

    async fn park<F>(&self, cancel: &CancellationToken, mut ready: F) -> Result<(), VmError>
    where
        F: FnMut(&mut State) -> bool,
    {
        loop {
            let notified = self.dock.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready(&mut self.state.lock()) {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(VmError::interrupt()),
            }
        }
    }

    /// Park until the next signal or until `timeout` passes.
    pub async fn dock_wait(&self, timeout: Duration, cancel: &CancellationToken) -> Result<(), VmError> {
        tokio::select! {
            _ = self.dock.notified() => Ok(()),
            _ = tokio::time::sleep(timeout) => Ok(()),
            _ = cancel.cancelled() => Err(VmError::interrupt()),
        }
    }

    pub fn notify(&self) {
        self.dock.notify_waiters();
    }

    /// Whether another live evaluation holds `event_id`.
    pub fn evaluating(&self, event_id: &EventId, except: EvalId) -> bool {
        self.state.lock().registry.count_event(event_id, except) > 0
    }

    /// Log prefix describing the engine and the slot.
    pub fn loghead(&self, id: EvalId) -> String {
        let st = self.state.lock();
        let c = st.counters;
        let mut head = format!("vm:{}:{}:{}", c.retired, c.committed, c.uncommitted);
        let Some(slot) = st.registry.get(id) else {
            head.push_str(&format!(" eval:{id} <gone>"));
            return head;
        };
        if let Some(parent) = slot.parent.and_then(|p| st.registry.get(p)) {
            head.push_str(&format!(" parent:{} {}", parent.id, parent.phase));
        }
        head.push_str(&format!(" eval:{} {} seq:{}", slot.id, slot.phase, slot.sequence));
        if let Some(event_id) = &slot.event_id {
            head.push(' ');
            head.push_str(event_id.as_str());
        }
        head
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The per-evaluation context.
//!
//! An `Eval` lives on the stack of the task performing the evaluation. Its
//! registry slot lives exactly as long as it does: dropping the handle, by
//! completion or by cancellation of the owning future, vacates the slot.

use super::fault::{Fault, VmError};
use super::opts::{Copts, Opts};
use super::phase::Phase;
use super::registry::EvalId;
use super::sequence::Sequencer;
use super::txn::{Notice, Txn};
use hsvm_kernel::{Conforms, Event, EventId, RoomId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Eval {
    pub id: EvalId,
    pub parent: Option<EvalId>,
    pub opts: Arc<Opts>,
    /// Present when the evaluation issues a local event.
    pub copts: Option<Arc<Copts>>,
    pub phase: Phase,
    pub sequence: u64,
    pub event_id: Option<EventId>,
    pub room_id: Option<RoomId>,
    pub room_version: Option<String>,
    pub report: Conforms,
    pub fault: Fault,
    /// Transaction this evaluation stages into, own or shared.
    pub txn: Option<Arc<Txn>>,
    /// Nearest ancestor's open transaction.
    pub inherited: Option<Arc<Txn>>,
    pub cancel: CancellationToken,
    /// Set once the current event's batch is committed; cancellation no
    /// longer applies to it.
    pub durable: bool,
    /// Notifications of transaction members, released after the commit.
    pub deferred: Vec<Notice>,
    pub evaluated: usize,
    pub accepted: usize,
    pub faulted: usize,
    seq: Arc<Sequencer>,
}

impl Eval {
    pub fn root(seq: Arc<Sequencer>, opts: Arc<Opts>, copts: Option<Arc<Copts>>, cancel: CancellationToken) -> Self {
        let id = seq.register(None);
        Self::build(id, None, seq, opts, copts, None, cancel)
    }

    pub fn child(parent: &Eval, opts: Arc<Opts>) -> Self {
        let id = parent.seq.register(Some(parent.id));
        let inherited = parent.txn.clone().or_else(|| parent.inherited.clone());
        Self::build(
            id,
            Some(parent.id),
            parent.seq.clone(),
            opts,
            None,
            inherited,
            parent.cancel.child_token(),
        )
    }

    fn build(
        id: EvalId,
        parent: Option<EvalId>,
        seq: Arc<Sequencer>,
        opts: Arc<Opts>,
        copts: Option<Arc<Copts>>,
        inherited: Option<Arc<Txn>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            parent,
            opts,
            copts,
            phase: Phase::None,
            sequence: 0,
            event_id: None,
            room_id: None,
            room_version: None,
            report: Conforms::empty(),
            fault: Fault::Accept,
            txn: None,
            inherited,
            cancel,
            durable: false,
            deferred: Vec::new(),
            evaluated: 0,
            accepted: 0,
            faulted: 0,
            seq,
        }
    }

    /// Take up `event` as the current event of the evaluation.
    pub fn begin(&mut self, event: &Event) {
        self.evaluated += 1;
        self.phase = Phase::None;
        self.sequence = 0;
        self.fault = Fault::Accept;
        self.durable = false;
        self.report = Conforms::empty();
        self.room_version = None;
        self.event_id = event.event_id().cloned();
        self.room_id = event.room_id().cloned();
    }

    /// Publish the current event id to the registry.
    pub fn publish_event(&self) {
        let event_id = self.event_id.clone();
        self.seq.update(self.id, |slot| slot.event_id = event_id);
    }

    /// Release per-event state, vacating any sequence still held.
    pub fn end(&mut self) {
        self.txn = None;
        self.durable = false;
        self.deferred.clear();
        self.sequence = 0;
        self.phase = Phase::None;
        self.seq.reset(self.id);
    }

    /// Enter `phase`, failing with INTERRUPT once cancelled unless the
    /// event is already durable.
    pub fn enter(&mut self, phase: Phase) -> Result<(), VmError> {
        if self.cancel.is_cancelled() && !self.durable {
            return Err(VmError::interrupt());
        }
        self.phase = phase;
        self.seq.enter(self.id, phase);
        Ok(())
    }

    pub fn enabled(&self, phase: Phase) -> bool {
        self.opts.phase.has(phase)
    }

    /// Whether this evaluation stages into an ancestor's transaction.
    pub fn is_member(&self) -> bool {
        matches!(&self.txn, Some(txn) if txn.owner != self.id)
    }

    pub fn issuing(&self) -> bool {
        self.copts.as_ref().map_or(false, |c| c.issue)
    }

    pub fn loghead(&self) -> String {
        let head = self.seq.loghead(self.id);
        match &self.opts.txn_id {
            Some(txn_id) => format!("{head} txn:{txn_id}"),
            None => head,
        }
    }
}

impl Drop for Eval {
    fn drop(&mut self) {
        self.seq.unregister(self.id);
    }
}

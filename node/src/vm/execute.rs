// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The phase machine.
//!
//! A batch is evaluated one event at a time on the caller's task. Each event
//! walks the phases in order; any phase may fault, which unwinds to
//! `handle_fault` where the Options decide whether the fault is logged,
//! returned, or thrown.

use super::eval::Eval;
use super::fault::{Fault, VmError};
use super::hook::Stage;
use super::opts::Opts;
use super::phase::Phase;
use super::txn::{self, Notice, Txn};
use super::Vm;
use futures::future::BoxFuture;
use hsvm_kernel::verify::verify_event;
use hsvm_kernel::{Event, IdFormat};
use hsvm_persistence::Appendix;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

impl Vm {
    /// Evaluate `events` with `opts`. A single event returns its own fault;
    /// a batch returns `Accept` unless interrupted.
    pub async fn execute(&self, events: Vec<Event>, opts: Opts) -> Result<Fault, VmError> {
        self.execute_cancellable(events, opts, CancellationToken::new()).await
    }

    /// As `execute`, interrupted when `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        events: Vec<Event>,
        opts: Opts,
        cancel: CancellationToken,
    ) -> Result<Fault, VmError> {
        let _activity = self.executing();
        let mut eval = Eval::root(self.seq.clone(), Arc::new(opts), None, cancel);
        self.execute_events(&mut eval, events).await
    }

    /// Evaluate `events` nested under `parent`, sharing its cancellation and
    /// any open transaction.
    pub fn execute_child<'a>(
        &'a self,
        parent: &'a Eval,
        events: Vec<Event>,
        opts: Opts,
    ) -> BoxFuture<'a, Result<Fault, VmError>> {
        Box::pin(async move {
            let mut eval = Eval::child(parent, Arc::new(opts));
            self.execute_events(&mut eval, events).await
        })
    }

    pub(crate) async fn execute_events(&self, eval: &mut Eval, mut events: Vec<Event>) -> Result<Fault, VmError> {
        if events.len() == 1 && eval.opts.limit > 0 {
            if let Some(event) = events.pop() {
                return self.execute_one(eval, event).await;
            }
        }

        if !eval.opts.ordered {
            events.sort();
        }

        let total = events.len();
        let (mut accepted, mut faulted, mut skipped) = (0usize, 0usize, 0usize);
        for event in events.into_iter().take(eval.opts.limit) {
            if !eval.opts.replays {
                if let Some(event_id) = event.event_id() {
                    if self.store.exists(event_id) {
                        skipped += 1;
                        continue;
                    }
                }
            }
            match self.execute_one(eval, event).await {
                Ok(Fault::Accept) => accepted += 1,
                Ok(_) => faulted += 1,
                Err(e) if e.code == Fault::Interrupt => return Err(e),
                Err(_) => faulted += 1,
            }
        }

        debug!(
            "{} batch of {} accepted:{} faulted:{} exists:{}",
            eval.loghead(),
            total,
            accepted,
            faulted,
            skipped
        );
        Ok(Fault::Accept)
    }

    async fn execute_one(&self, eval: &mut Eval, event: Event) -> Result<Fault, VmError> {
        eval.begin(&event);
        let result = match self.execute_du(eval, &event).await {
            Ok(()) => {
                self.accept(eval, &event);
                Ok(Fault::Accept)
            }
            Err(e) => self.handle_fault(eval, e.at(event.event_id(), event.room_id())),
        };
        eval.end();
        result
    }

    async fn execute_du(&self, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        eval.enter(Phase::Execute)?;
        let is_edu = eval.opts.edu || event.is_edu();

        if eval.enabled(Phase::Conform) {
            eval.enter(Phase::Conform)?;
            self.hooks.call(Stage::Conform, self, eval, event).await?;
        }

        match event.event_id() {
            Some(event_id) if !is_edu && eval.opts.unique && eval.enabled(Phase::DupWait) => {
                eval.enter(Phase::DupWait)?;
                let holder = self.seq.with_registry(|reg| reg.find_event(event_id).map(|s| s.id));
                if let Some(holder) = holder {
                    debug!("{} waiting on eval {} for {}", eval.loghead(), holder, event_id);
                }
                self.seq.claim_event(eval.id, event_id, &eval.cancel).await?;
            }
            _ => eval.publish_event(),
        }

        if is_edu {
            self.execute_edu(eval, event).await?;
        } else {
            self.execute_pdu(eval, event).await?;
        }

        if eval.enabled(Phase::Notify) {
            eval.enter(Phase::Notify)?;
            self.notify(eval, event);
            self.hooks.call(Stage::Notify, self, eval, event).await?;
        }
        for notice in std::mem::take(&mut eval.deferred) {
            self.deliver(notice);
        }

        if eval.enabled(Phase::Effects) {
            eval.enter(Phase::Effects)?;
            self.hooks.call(Stage::Effect, self, eval, event).await?;
        }
        Ok(())
    }

    async fn execute_edu(&self, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        if eval.issuing() && eval.enabled(Phase::Issue) {
            eval.enter(Phase::Issue)?;
            self.hooks.call(Stage::Issue, self, eval, event).await?;
        }
        if eval.enabled(Phase::Evaluate) {
            eval.enter(Phase::Evaluate)?;
            self.hooks.call(Stage::Eval, self, eval, event).await?;
        }
        if eval.enabled(Phase::Post) {
            eval.enter(Phase::Post)?;
            self.hooks.call(Stage::Post, self, eval, event).await?;
        }
        Ok(())
    }

    async fn execute_pdu(&self, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        let room_id = event
            .room_id()
            .ok_or_else(|| VmError::new(Fault::Invalid, "PDU has no room_id"))?;
        let event_id = event
            .event_id()
            .ok_or_else(|| VmError::new(Fault::Invalid, "PDU has no event_id"))?;

        if eval.opts.require_content && !event.content().is_object() {
            return Err(VmError::new(Fault::Invalid, "Missing content object"));
        }

        eval.room_version = match &eval.opts.room_version {
            Some(version) => Some(version.clone()),
            None if event.is_create() => Some(
                event
                    .content()
                    .get("room_version")
                    .and_then(|v| v.as_str())
                    .unwrap_or("1")
                    .to_string(),
            ),
            None => self.store.room_version(room_id)?,
        };
        if let Some(version) = &eval.room_version {
            if event_id.format() != IdFormat::for_room_version(version) {
                return Err(VmError::new(
                    Fault::Invalid,
                    format!("event id format does not match room version {version}"),
                ));
            }
        }

        if eval.enabled(Phase::DupChk) && !eval.opts.replays {
            eval.enter(Phase::DupChk)?;
            if self.store.exists(event_id) {
                return Err(VmError::new(Fault::Exists, "Event has already been evaluated."));
            }
        }

        if eval.issuing() && eval.enabled(Phase::Issue) {
            eval.enter(Phase::Issue)?;
            self.hooks.call(Stage::Issue, self, eval, event).await?;
        }

        if eval.enabled(Phase::Access) {
            eval.enter(Phase::Access)?;
            self.hooks.call(Stage::Access, self, eval, event).await?;
        }

        if eval.enabled(Phase::Emption) {
            eval.enter(Phase::Emption)?;
            self.emption_check(event)?;
        }

        if eval.enabled(Phase::Verify) && eval.copts.is_none() {
            eval.enter(Phase::Verify)?;
            verify_event(&*self.keyring, event)
                .map_err(|e| VmError::new(Fault::Invalid, format!("Signature verification failed: {e}")))?;
        }

        if eval.enabled(Phase::FetchAuth) && eval.opts.fetch {
            eval.enter(Phase::FetchAuth)?;
            self.hooks.call(Stage::Fetch, self, eval, event).await?;
        }

        if eval.enabled(Phase::AuthStatic) && eval.opts.auth {
            eval.enter(Phase::AuthStatic)?;
            self.auth_static(event)?;
        }

        if eval.enabled(Phase::FetchPrev) && eval.opts.fetch {
            eval.enter(Phase::FetchPrev)?;
            self.hooks.call(Stage::Fetch, self, eval, event).await?;
        }

        if eval.enabled(Phase::FetchState) && eval.opts.fetch {
            eval.enter(Phase::FetchState)?;
            self.hooks.call(Stage::Fetch, self, eval, event).await?;
        }

        // Ordering is not optional: the commit wait runs even when the
        // phase is masked.
        eval.enter(Phase::PreCommit)?;
        let group = eval.inherited.as_ref().map(|t| t.owner);
        let (sequence, joined) = self.seq.acquire(eval.id, group);
        eval.sequence = sequence;
        if eval.copts.as_ref().map_or(false, |c| c.debuglog_precommit) {
            debug!("{} precommit {}", eval.loghead(), event.pretty_oneline());
        }
        if !joined {
            self.seq.await_commit_turn(eval.id, &eval.cancel).await?;
        }

        if eval.enabled(Phase::PreIndex) {
            eval.enter(Phase::PreIndex)?;
            let warm = self.store.prefetch(event);
            debug!("{} preindex {} references present", eval.loghead(), warm);
        }

        if eval.enabled(Phase::AuthRela) && eval.opts.auth {
            eval.enter(Phase::AuthRela)?;
            self.authority
                .check_relative(event, &*self.store)
                .map_err(|m| VmError::new(Fault::Auth, m))?;
        }

        eval.enter(Phase::Commit)?;
        self.write_prepare(eval, event, joined);

        let mut present = eval.opts.present;
        if eval.enabled(Phase::AuthPres) && eval.opts.auth {
            eval.enter(Phase::AuthPres)?;
            if let Err(reason) = self.authority.check_present(event, &*self.store) {
                warn!("{} present state not updated: {}", eval.loghead(), reason);
                present = false;
            }
        }

        if eval.enabled(Phase::Evaluate) {
            eval.enter(Phase::Evaluate)?;
            self.hooks.call(Stage::Eval, self, eval, event).await?;
        }

        if eval.enabled(Phase::Index) {
            eval.enter(Phase::Index)?;
            self.write_append(eval, event, present)?;
        }

        if eval.enabled(Phase::Post) {
            eval.enter(Phase::Post)?;
            self.hooks.call(Stage::Post, self, eval, event).await?;
        }

        // Members are made durable by the transaction's owner.
        if joined {
            return Ok(());
        }

        if eval.enabled(Phase::Write) {
            eval.enter(Phase::Write)?;
            self.write_commit(eval)?;
        } else {
            if let Some(txn) = eval.txn.take() {
                eval.deferred = txn.take_deferred();
            }
            self.seq.mark_committed(eval.id);
            eval.durable = true;
        }

        // Committed: nothing from here on may reject the event.
        eval.enter(Phase::Retire)?;
        if let Err(e) = self.seq.await_retire_turn(eval.id, &eval.cancel).await {
            debug!("{} {}; retiring out of turn", eval.loghead(), e);
        }
        let counters = self.seq.retire(eval.id);
        metrics::gauge!("hsvm_sequence_retired", counters.retired as f64);
        debug!("{} retired", eval.loghead());
        Ok(())
    }

    /// Reject events that concern no local user.
    fn emption_check(&self, event: &Event) -> Result<(), VmError> {
        let my = &self.cfg.server_name;
        if event.origin() == Some(my) {
            return Ok(());
        }
        if event.membership().is_some() {
            let target = event.state_key().and_then(|k| hsvm_kernel::UserId::parse(k).ok());
            if target.and_then(|u| u.host()).as_ref() == Some(my) {
                return Ok(());
            }
        }
        match event.room_id() {
            Some(room_id) if self.store.local_joined(room_id, my) => Ok(()),
            _ => Err(VmError::new(
                Fault::Bounce,
                "No users on this server are joined to the room.",
            )),
        }
    }

    fn auth_static(&self, event: &Event) -> Result<(), VmError> {
        let ids = event.auth_events();
        let mut auth = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(found) = self.store.get_event(id)? {
                auth.push(found);
            }
        }
        if auth.len() < ids.len() {
            return Err(VmError::new(
                Fault::Auth,
                format!("Missing {} of {} auth_events", ids.len() - auth.len(), ids.len()),
            ));
        }
        self.authority
            .check_static(event, &auth)
            .map_err(|m| VmError::new(Fault::Auth, m))
    }

    fn write_prepare(&self, eval: &mut Eval, event: &Event, joined: bool) {
        if joined {
            eval.txn = eval.inherited.clone();
            debug!(
                "{} staging into transaction of eval {}",
                eval.loghead(),
                eval.txn.as_ref().map(|t| t.owner).unwrap_or_default()
            );
            return;
        }
        let reserve = txn::calc_reserve(&eval.opts, event);
        eval.txn = Some(Arc::new(Txn::new(eval.id, eval.sequence, reserve)));
    }

    fn write_append(&self, eval: &mut Eval, event: &Event, present: bool) -> Result<(), VmError> {
        let txn = eval
            .txn
            .clone()
            .ok_or_else(|| VmError::new(Fault::General, "No transaction to stage into"))?;
        let mut wopts = eval.opts.wopts.clone();
        wopts.event_idx = eval.sequence;
        if !present || !self.state_is_newer(event) {
            wopts.appendix -= Appendix::ROOM_STATE | Appendix::ROOM_JOINED;
        }
        let staged = txn.append(&*self.store, event, &wopts);
        debug!("{} staged {} cells, transaction holds {}", eval.loghead(), staged, txn.size());
        Ok(())
    }

    /// Whether `event` supersedes the present state cell it addresses.
    fn state_is_newer(&self, event: &Event) -> bool {
        let (Some(room_id), Some(state_key)) = (event.room_id(), event.state_key()) else {
            return true;
        };
        match self.store.state_event(room_id, event.kind(), state_key) {
            Ok(Some(current)) => event.depth() > current.depth(),
            Ok(None) => true,
            Err(e) => {
                warn!("present state lookup for {} failed: {}", event.kind(), e);
                false
            }
        }
    }

    fn write_commit(&self, eval: &mut Eval) -> Result<(), VmError> {
        let txn = eval
            .txn
            .take()
            .ok_or_else(|| VmError::new(Fault::General, "No transaction to commit"))?;
        let batch = txn.take();
        let (cells, bytes) = (batch.size(), batch.bytes());
        let started = Instant::now();
        self.store
            .commit(batch)
            .map_err(|e| VmError::new(Fault::General, format!("write commit failed: {e}")))?;
        let counters = self.seq.mark_committed(eval.id);
        eval.durable = true;
        eval.deferred = txn.take_deferred();

        metrics::counter!("hsvm_write_commit_total", 1);
        metrics::histogram!("hsvm_write_commit_duration_seconds", started.elapsed().as_secs_f64());

        let infolog = eval.copts.as_ref().map_or(false, |c| c.infolog_postcommit);
        if infolog {
            info!(
                "{} committed {} events {} cells {} bytes to {}",
                eval.loghead(),
                txn.events(),
                cells,
                bytes,
                counters.committed
            );
        } else if self.cfg.vm.log_commit_debug {
            debug!(
                "{} committed {} events {} cells {} bytes to {}",
                eval.loghead(),
                txn.events(),
                cells,
                bytes,
                counters.committed
            );
        }
        Ok(())
    }

    /// Deliver the current event, or hold it with the transaction it was
    /// staged into until that transaction's owner commits.
    fn notify(&self, eval: &Eval, event: &Event) {
        let local = eval.issuing() || event.origin() == Some(&self.cfg.server_name);
        let notice = Notice {
            event: event.clone(),
            clients: eval.opts.notify_clients,
            servers: eval.opts.notify_servers && local,
            client_txnid: eval.copts.as_ref().and_then(|c| c.client_txnid.clone()),
        };
        if !notice.clients && !notice.servers {
            return;
        }
        match &eval.txn {
            Some(txn) if eval.is_member() => txn.defer(notice),
            _ => self.deliver(notice),
        }
    }

    fn accept(&self, eval: &mut Eval, event: &Event) {
        eval.accepted += 1;
        metrics::counter!("hsvm_evals_accepted_total", 1);
        if eval.opts.infolog_accept || self.cfg.vm.log_accept_info {
            info!("{} accepted {}", eval.loghead(), event.pretty_oneline());
        } else if eval.opts.debuglog_accept || self.cfg.vm.log_accept_debug {
            debug!("{} accepted {}", eval.loghead(), event.pretty_oneline());
        }
    }

    /// Log `err` per the Options and either return its code or throw it.
    fn handle_fault(&self, eval: &mut Eval, err: VmError) -> Result<Fault, VmError> {
        let code = err.code;
        eval.fault = code;
        eval.faulted += 1;
        metrics::counter!("hsvm_evals_faulted_total", 1, "fault" => code.reflect());

        let opts = &eval.opts;
        if opts.errorlog.has(code) {
            error!("{} {}", eval.loghead(), err);
        } else if opts.warnlog.has(code) {
            warn!("{} {}", eval.loghead(), err);
        } else {
            debug!("{} {}", eval.loghead(), err);
        }

        if opts.nothrows.has(code) {
            Ok(code)
        } else {
            Err(err)
        }
    }
}

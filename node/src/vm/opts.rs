// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Evaluation options.
//!
//! `Opts` is an immutable snapshot: an evaluation receives it behind an `Arc`
//! and never mutates it. Derived options for nested evaluations are built by
//! cloning and adjusting, never by editing the parent's.

use super::fault::FaultMask;
use super::phase::PhaseMask;
use bitflags::bitflags;
use hsvm_kernel::{Conforms, ServerName, UserId};
use hsvm_persistence::WriteOpts;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Opts {
    /// Remote the event was received from; the first fetch candidate.
    pub node_id: Option<ServerName>,
    /// Local user on whose behalf the event was issued.
    pub user_id: Option<UserId>,
    pub txn_id: Option<String>,

    pub phase: PhaseMask,
    /// Template for the index pass; `event_idx` is filled per event.
    pub wopts: WriteOpts,

    pub notify_clients: bool,
    pub notify_servers: bool,

    /// Run the conformity check.
    pub conforming: bool,
    /// Conformity failures tolerated.
    pub non_conform: Conforms,

    pub auth: bool,
    pub fetch: bool,
    pub room_version: Option<String>,
    /// Reject events without a content object.
    pub require_content: bool,
    /// Permit updates to present state.
    pub present: bool,

    /// Evaluate as an EDU regardless of the record's shape.
    pub edu: bool,
    /// Re-evaluate events already in the database instead of faulting EXISTS.
    pub replays: bool,
    /// Wait out concurrent evaluations of the same event id.
    pub unique: bool,
    /// The batch is already in dependency order.
    pub ordered: bool,
    /// Evaluate at most this many events of a batch.
    pub limit: usize,

    /// Fault EVENT unless at least one prev event is present after fetching.
    pub fetch_prev_any: bool,
    /// Fault EVENT unless every prev event is present after fetching.
    pub fetch_prev_all: bool,
    pub fetch_prev_wait_count: Option<usize>,
    pub fetch_prev_wait_time: Option<Duration>,
    pub fetch_prev_limit: Option<usize>,
    /// Acquire state when any prev event is missing, rather than all.
    pub fetch_state_any: bool,
    /// Acquire state even when the event is deeper than the room.
    pub fetch_state_shallow: bool,

    /// Batch reservation; `None` sizes it from the event.
    pub reserve_bytes: Option<usize>,
    /// Index overhead added to the reservation.
    pub reserve_index: usize,

    /// Faults returned instead of thrown.
    pub nothrows: FaultMask,
    pub errorlog: FaultMask,
    pub warnlog: FaultMask,
    pub debuglog_accept: bool,
    pub infolog_accept: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            node_id: None,
            user_id: None,
            txn_id: None,
            phase: PhaseMask::all(),
            wopts: WriteOpts::default(),
            notify_clients: true,
            notify_servers: true,
            conforming: true,
            non_conform: Conforms::empty(),
            auth: true,
            fetch: true,
            room_version: None,
            require_content: true,
            present: true,
            edu: false,
            replays: false,
            unique: true,
            ordered: false,
            limit: usize::MAX,
            fetch_prev_any: false,
            fetch_prev_all: false,
            fetch_prev_wait_count: None,
            fetch_prev_wait_time: None,
            fetch_prev_limit: None,
            fetch_state_any: false,
            fetch_state_shallow: false,
            reserve_bytes: None,
            reserve_index: 1024,
            nothrows: FaultMask::EXISTS,
            errorlog: FaultMask::all() - FaultMask::EXISTS,
            warnlog: FaultMask::EXISTS,
            debuglog_accept: false,
            infolog_accept: false,
        }
    }
}

impl Opts {
    pub fn with_phase_disabled(mut self, phases: PhaseMask) -> Self {
        self.phase -= phases;
        self
    }

    /// Options for a remote event received from `origin`.
    pub fn from_remote(origin: ServerName) -> Self {
        Self {
            node_id: Some(origin),
            ..Default::default()
        }
    }
}

bitflags! {
    /// Fields `inject` composes when the caller leaves them out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropMask: u32 {
        const AUTH_EVENTS = 1 << 0;
        const DEPTH = 1 << 1;
        const PREV_EVENTS = 1 << 2;
        const ORIGIN = 1 << 3;
        const ORIGIN_SERVER_TS = 1 << 4;
        const HASHES = 1 << 5;
        const SIGNATURES = 1 << 6;
        const EVENT_ID = 1 << 7;
    }
}

/// Options for issuing a new local event.
#[derive(Clone, Debug)]
pub struct Copts {
    pub opts: Opts,
    /// Client transaction id echoed back to the issuing client.
    pub client_txnid: Option<String>,
    pub prop_mask: PropMask,
    /// Run the issue stage.
    pub issue: bool,
    pub debuglog_precommit: bool,
    pub infolog_postcommit: bool,
}

impl Default for Copts {
    fn default() -> Self {
        Self {
            opts: Opts {
                // Local events never need fetching; their dependencies are ours.
                fetch: false,
                ..Default::default()
            },
            client_txnid: None,
            prop_mask: PropMask::all(),
            issue: true,
            debuglog_precommit: false,
            infolog_postcommit: false,
        }
    }
}

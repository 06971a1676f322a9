// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Evaluation phases, in execution order.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    None = 0,
    Execute,
    Conform,
    DupWait,
    DupChk,
    Issue,
    Access,
    Emption,
    Verify,
    FetchAuth,
    AuthStatic,
    FetchPrev,
    FetchState,
    PreCommit,
    PreIndex,
    AuthRela,
    Commit,
    AuthPres,
    Evaluate,
    Index,
    Post,
    Write,
    Retire,
    Notify,
    Effects,
}

impl Phase {
    pub const ORDER: [Phase; 24] = [
        Phase::Execute,
        Phase::Conform,
        Phase::DupWait,
        Phase::DupChk,
        Phase::Issue,
        Phase::Access,
        Phase::Emption,
        Phase::Verify,
        Phase::FetchAuth,
        Phase::AuthStatic,
        Phase::FetchPrev,
        Phase::FetchState,
        Phase::PreCommit,
        Phase::PreIndex,
        Phase::AuthRela,
        Phase::Commit,
        Phase::AuthPres,
        Phase::Evaluate,
        Phase::Index,
        Phase::Post,
        Phase::Write,
        Phase::Retire,
        Phase::Notify,
        Phase::Effects,
    ];

    pub fn mask(self) -> PhaseMask {
        match self {
            Phase::None => PhaseMask::empty(),
            p => PhaseMask::from_bits_truncate(1 << (p as u8 - 1)),
        }
    }

    pub fn reflect(self) -> &'static str {
        match self {
            Phase::None => "NONE",
            Phase::Execute => "EXECUTE",
            Phase::Conform => "CONFORM",
            Phase::DupWait => "DUPWAIT",
            Phase::DupChk => "DUPCHK",
            Phase::Issue => "ISSUE",
            Phase::Access => "ACCESS",
            Phase::Emption => "EMPTION",
            Phase::Verify => "VERIFY",
            Phase::FetchAuth => "FETCH_AUTH",
            Phase::AuthStatic => "AUTH_STATIC",
            Phase::FetchPrev => "FETCH_PREV",
            Phase::FetchState => "FETCH_STATE",
            Phase::PreCommit => "PRECOMMIT",
            Phase::PreIndex => "PREINDEX",
            Phase::AuthRela => "AUTH_RELA",
            Phase::Commit => "COMMIT",
            Phase::AuthPres => "AUTH_PRES",
            Phase::Evaluate => "EVALUATE",
            Phase::Index => "INDEX",
            Phase::Post => "POST",
            Phase::Write => "WRITE",
            Phase::Retire => "RETIRE",
            Phase::Notify => "NOTIFY",
            Phase::Effects => "EFFECTS",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reflect())
    }
}

bitflags! {
    /// Set of enabled phases.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PhaseMask: u32 {
        const EXECUTE = 1 << 0;
        const CONFORM = 1 << 1;
        const DUPWAIT = 1 << 2;
        const DUPCHK = 1 << 3;
        const ISSUE = 1 << 4;
        const ACCESS = 1 << 5;
        const EMPTION = 1 << 6;
        const VERIFY = 1 << 7;
        const FETCH_AUTH = 1 << 8;
        const AUTH_STATIC = 1 << 9;
        const FETCH_PREV = 1 << 10;
        const FETCH_STATE = 1 << 11;
        const PRECOMMIT = 1 << 12;
        const PREINDEX = 1 << 13;
        const AUTH_RELA = 1 << 14;
        const COMMIT = 1 << 15;
        const AUTH_PRES = 1 << 16;
        const EVALUATE = 1 << 17;
        const INDEX = 1 << 18;
        const POST = 1 << 19;
        const WRITE = 1 << 20;
        const RETIRE = 1 << 21;
        const NOTIFY = 1 << 22;
        const EFFECTS = 1 << 23;
    }
}

impl PhaseMask {
    pub fn has(&self, phase: Phase) -> bool {
        phase != Phase::None && self.contains(phase.mask())
    }
}

impl Default for PhaseMask {
    fn default() -> Self {
        PhaseMask::all()
    }
}

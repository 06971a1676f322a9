// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Fault taxonomy.
//!
//! A `Fault` is the terminal value of an evaluation. `Accept` is the only
//! non-error value. The codes are single bits so that Options can carry
//! per-code dispositions as a `FaultMask`.

use bitflags::bitflags;
use hsvm_kernel::{EventId, KernelError, RoomId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Fault {
    /// No fault.
    Accept = 0x000,
    /// Replaying an event already in the database.
    Exists = 0x001,
    /// Unclassified failure.
    General = 0x002,
    /// Malformed or non-conforming event.
    Invalid = 0x004,
    /// Authorization failed.
    Auth = 0x008,
    /// Required room state is missing.
    State = 0x010,
    /// A dependency event is missing.
    Event = 0x020,
    /// The event is irrelevant to this server.
    Bounce = 0x040,
    /// Rejected by local policy.
    DoNotWant = 0x080,
    /// Access to the evaluation denied.
    Denied = 0x100,
    /// Identity mismatch.
    Ident = 0x200,
    /// The evaluation's task was cancelled.
    Interrupt = 0x400,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FaultMask: u32 {
        const EXISTS = Fault::Exists as u32;
        const GENERAL = Fault::General as u32;
        const INVALID = Fault::Invalid as u32;
        const AUTH = Fault::Auth as u32;
        const STATE = Fault::State as u32;
        const EVENT = Fault::Event as u32;
        const BOUNCE = Fault::Bounce as u32;
        const DONOTWANT = Fault::DoNotWant as u32;
        const DENIED = Fault::Denied as u32;
        const IDENT = Fault::Ident as u32;
        const INTERRUPT = Fault::Interrupt as u32;
    }
}

impl FaultMask {
    pub fn has(&self, fault: Fault) -> bool {
        fault != Fault::Accept && self.contains(fault.mask())
    }
}

impl Fault {
    pub const ALL: [Fault; 12] = [
        Fault::Accept,
        Fault::Exists,
        Fault::General,
        Fault::Invalid,
        Fault::Auth,
        Fault::State,
        Fault::Event,
        Fault::Bounce,
        Fault::DoNotWant,
        Fault::Denied,
        Fault::Ident,
        Fault::Interrupt,
    ];

    pub fn mask(self) -> FaultMask {
        FaultMask::from_bits_truncate(self as u32)
    }

    pub fn is_accept(self) -> bool {
        self == Fault::Accept
    }

    pub fn reflect(self) -> &'static str {
        match self {
            Fault::Accept => "#ACCEPT",
            Fault::Exists => "#EXISTS",
            Fault::General => "#GENERAL",
            Fault::Invalid => "#INVALID",
            Fault::Auth => "#AUTH",
            Fault::State => "#STATE",
            Fault::Event => "#EVENT",
            Fault::Bounce => "#BOUNCE",
            Fault::DoNotWant => "#DONOTWANT",
            Fault::Denied => "#DENIED",
            Fault::Ident => "#IDENT",
            Fault::Interrupt => "#INTERRUPT",
        }
    }

    /// HTTP status reported to a remote or client for this fault.
    pub fn http_status(self) -> u16 {
        match self {
            Fault::Accept => 200,
            Fault::Exists => 409,
            Fault::Invalid | Fault::Ident => 400,
            Fault::Auth | Fault::Denied | Fault::DoNotWant => 403,
            Fault::State | Fault::Event => 404,
            Fault::Bounce => 406,
            Fault::Interrupt => 503,
            Fault::General => 500,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reflect())
    }
}

/// A thrown fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} execute {} {} :{message}", or_edu(.event_id), or_edu(.room_id))]
pub struct VmError {
    pub code: Fault,
    pub event_id: Option<EventId>,
    pub room_id: Option<RoomId>,
    pub message: String,
}

fn or_edu<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<edu>".to_string())
}

impl VmError {
    pub fn new(code: Fault, message: impl Into<String>) -> Self {
        Self {
            code,
            event_id: None,
            room_id: None,
            message: message.into(),
        }
    }

    pub fn interrupt() -> Self {
        Self::new(Fault::Interrupt, "evaluation interrupted")
    }

    /// Attach the identity of the event being evaluated, keeping any identity
    /// already attached by a nested evaluation.
    pub fn at(mut self, event_id: Option<&EventId>, room_id: Option<&RoomId>) -> Self {
        if self.event_id.is_none() {
            self.event_id = event_id.cloned();
        }
        if self.room_id.is_none() {
            self.room_id = room_id.cloned();
        }
        self
    }
}

impl From<KernelError> for VmError {
    fn from(e: KernelError) -> Self {
        VmError::new(Fault::Invalid, e.to_string())
    }
}

impl From<hsvm_persistence::PersistenceError> for VmError {
    fn from(e: hsvm_persistence::PersistenceError) -> Self {
        VmError::new(Fault::General, e.to_string())
    }
}

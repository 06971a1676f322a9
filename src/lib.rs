// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! hsvm-kernel: the data model of the homeserver event engine.
//!
//! Identifiers, the immutable event record, canonical JSON, content and
//! reference hashing, the conformity report and the signing keyring. Nothing
//! in this crate performs I/O or suspends.

pub mod config;
pub mod conforms;
pub mod error;
pub mod event;
pub mod hash;
pub mod types;
pub mod verify;

pub use conforms::Conforms;
pub use error::{KernelError, KernelResult};
pub use event::Event;
pub use types::id::{EventId, IdFormat, RoomId, ServerName, UserId};
pub use verify::{Keyring, LocalKeyring};

#[cfg(test)]
pub mod tests;

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Protocol limits and defaults shared by every crate in the workspace.

/// Largest serialized event accepted from anywhere.
pub const EVENT_MAX_SIZE: usize = 65_507;

/// Largest identifier, sigil and host included.
pub const ID_MAX_SIZE: usize = 255;

pub const PREV_EVENTS_MAX: usize = 20;
pub const AUTH_EVENTS_MAX: usize = 10;

/// Room version assumed for new rooms.
pub const DEFAULT_ROOM_VERSION: &str = "10";

/// Room versions whose event ids carry their origin (`$local:host`).
pub const LEGACY_ROOM_VERSIONS: &[&str] = &["1", "2"];

/// Key id used by `LocalKeyring` signatures.
pub const SIGNING_KEY_ID: &str = "blake3:auto";

/// Name of the content hash algorithm in an event's `hashes` object.
pub const HASH_ALGORITHM: &str = "blake3";

pub fn is_legacy_version(room_version: &str) -> bool {
    LEGACY_ROOM_VERSIONS.contains(&room_version)
}

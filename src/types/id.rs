// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Identity types.
//!
//! Every identifier is a validated string newtype. Validation happens once,
//! at construction; afterwards the value is immutable and cheap to compare.
//!
//! # Grammar
//! - `EventId`: `$opaque` (hashed) or `$local:host` (legacy)
//! - `RoomId`: `!local:host`
//! - `UserId`: `@local:host`
//! - `ServerName`: `host` or `host:port`

use crate::config::ID_MAX_SIZE;
use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $check:path) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(value: impl Into<String>) -> KernelResult<Self> {
                let value = value.into();
                if value.is_empty() || value.len() > ID_MAX_SIZE || !$check(&value) {
                    return Err(KernelError::InvalidId { kind: $kind, value });
                }
                Ok(Self(value))
            }

            /// For values produced by this crate that satisfy the grammar by
            /// construction.
            #[allow(dead_code)]
            pub(crate) fn new_unchecked(value: String) -> Self {
                Self(value)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = KernelError;
            fn try_from(value: String) -> KernelResult<Self> {
                Self::parse(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = KernelError;
            fn try_from(value: &str) -> KernelResult<Self> {
                Self::parse(value)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;
            fn from_str(value: &str) -> KernelResult<Self> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

string_id!(
    /// Identity of a PDU.
    EventId, "event id", valid_event_id
);
string_id!(
    RoomId, "room id", valid_room_id
);
string_id!(
    UserId, "user id", valid_user_id
);
string_id!(
    /// DNS name (optionally with port) of a federation participant.
    ServerName, "server name", valid_server_name
);

/// How an event id was minted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdFormat {
    /// `$local:host`; the origin is recoverable from the id.
    Legacy,
    /// `$base64url(reference hash)`; the id is derived from the content.
    Hashed,
}

impl IdFormat {
    pub fn for_room_version(room_version: &str) -> Self {
        if crate::config::is_legacy_version(room_version) {
            IdFormat::Legacy
        } else {
            IdFormat::Hashed
        }
    }
}

impl EventId {
    pub fn format(&self) -> IdFormat {
        if self.0.contains(':') {
            IdFormat::Legacy
        } else {
            IdFormat::Hashed
        }
    }

    /// Origin server of a legacy id. Hashed ids carry no host.
    pub fn host(&self) -> Option<ServerName> {
        host_of(&self.0)
    }
}

impl RoomId {
    pub fn host(&self) -> Option<ServerName> {
        host_of(&self.0)
    }
}

impl UserId {
    pub fn host(&self) -> Option<ServerName> {
        host_of(&self.0)
    }

    pub fn localpart(&self) -> &str {
        self.0[1..].split(':').next().unwrap_or_default()
    }
}

impl ServerName {
    /// Host without the port.
    pub fn hostname(&self) -> &str {
        match self.0.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.0,
        }
    }
}

fn host_of(id: &str) -> Option<ServerName> {
    let (_, host) = id.split_once(':')?;
    ServerName::parse(host).ok()
}

fn valid_event_id(s: &str) -> bool {
    match s.strip_prefix('$') {
        Some(rest) if !rest.is_empty() => match rest.split_once(':') {
            Some((local, host)) => !local.is_empty() && valid_server_name(host),
            None => rest
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        },
        _ => false,
    }
}

fn valid_room_id(s: &str) -> bool {
    sigiled(s, '!')
}

fn valid_user_id(s: &str) -> bool {
    sigiled(s, '@')
}

fn sigiled(s: &str, sigil: char) -> bool {
    let Some(rest) = s.strip_prefix(sigil) else {
        return false;
    };
    match rest.split_once(':') {
        Some((local, host)) => !local.is_empty() && valid_server_name(host),
        None => false,
    }
}

fn valid_server_name(s: &str) -> bool {
    if s.is_empty() || s.len() > ID_MAX_SIZE {
        return false;
    }
    let host = match s.rsplit_once(':') {
        Some((h, p)) if !p.is_empty() && p.len() <= 5 && p.chars().all(|c| c.is_ascii_digit()) => h,
        _ => s,
    };
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '[' | ']' | ':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_event_id_has_host() {
        let id = EventId::parse("$abc:example.org").unwrap();
        assert_eq!(id.format(), IdFormat::Legacy);
        assert_eq!(id.host().unwrap().as_str(), "example.org");
    }

    #[test]
    fn test_hashed_event_id_has_no_host() {
        let id = EventId::parse("$Rqnc-F-dvnEYJTyHq_iKxU2bZ1CI92-kuZq3a5lr5Zg").unwrap();
        assert_eq!(id.format(), IdFormat::Hashed);
        assert!(id.host().is_none());
    }

    #[test]
    fn test_rejects_bad_sigils() {
        assert!(EventId::parse("abc:example.org").is_err());
        assert!(RoomId::parse("$room:example.org").is_err());
        assert!(UserId::parse("@:example.org").is_err());
        assert!(ServerName::parse("bad host").is_err());
    }

    #[test]
    fn test_server_name_with_port() {
        let name = ServerName::parse("localhost:8448").unwrap();
        assert_eq!(name.hostname(), "localhost");
        let room = RoomId::parse("!r:localhost:8448").unwrap();
        assert_eq!(room.host().unwrap(), name);
    }
}

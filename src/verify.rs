// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Signing and verification.
//!
//! The engine depends only on the `Keyring` trait. `LocalKeyring` signs with
//! a keyed BLAKE3 MAC per server, which is enough for a closed federation of
//! nodes sharing a key table and for exercising every verification path.

use crate::config::{HASH_ALGORITHM, SIGNING_KEY_ID};
use crate::error::{KernelError, KernelResult};
use crate::event::Event;
use crate::hash;
use crate::types::id::{EventId, IdFormat, ServerName};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

pub trait Keyring: Send + Sync {
    /// Whether a key for `server` is cached locally.
    fn has_key(&self, server: &ServerName) -> bool;

    fn sign(&self, server: &ServerName, payload: &[u8]) -> KernelResult<String>;

    fn verify(&self, server: &ServerName, payload: &[u8], signature: &str) -> bool;
}

#[derive(Default, Clone)]
pub struct LocalKeyring {
    keys: FxHashMap<ServerName, [u8; 32]>,
}

impl LocalKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, server: ServerName, secret: [u8; 32]) -> Self {
        self.keys.insert(server, secret);
        self
    }

    /// Key derived from the server name and a shared seed.
    pub fn with_derived(self, server: ServerName, seed: &str) -> Self {
        let secret = blake3::derive_key("hsvm keyring v1", format!("{seed}/{server}").as_bytes());
        self.with_key(server, secret)
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerName> {
        self.keys.keys()
    }
}

impl Keyring for LocalKeyring {
    fn has_key(&self, server: &ServerName) -> bool {
        self.keys.contains_key(server)
    }

    fn sign(&self, server: &ServerName, payload: &[u8]) -> KernelResult<String> {
        let key = self
            .keys
            .get(server)
            .ok_or_else(|| KernelError::NoKey(server.to_string()))?;
        Ok(STANDARD_NO_PAD.encode(blake3::keyed_hash(key, payload).as_bytes()))
    }

    fn verify(&self, server: &ServerName, payload: &[u8], signature: &str) -> bool {
        let Some(key) = self.keys.get(server) else {
            return false;
        };
        let Ok(raw) = STANDARD_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(raw) = <[u8; 32]>::try_from(raw.as_slice()) else {
            return false;
        };
        // blake3::Hash equality is constant time.
        blake3::keyed_hash(key, payload) == blake3::Hash::from(raw)
    }
}

/// Verify the origin's signature on an event.
pub fn verify_event(keyring: &dyn Keyring, event: &Event) -> KernelResult<()> {
    let origin = event.origin().ok_or(KernelError::MissingField("origin"))?;
    if !keyring.has_key(origin) {
        return Err(KernelError::NoKey(origin.to_string()));
    }
    let signature = event
        .get("signatures")
        .and_then(|s| s.get(origin.as_str()))
        .and_then(|s| s.get(SIGNING_KEY_ID))
        .and_then(Value::as_str)
        .ok_or_else(|| KernelError::BadSignature(origin.to_string()))?;

    if keyring.verify(origin, &hash::signing_payload(event.source()), signature) {
        Ok(())
    } else {
        Err(KernelError::BadSignature(origin.to_string()))
    }
}

/// Finish a composed record: publish its content hash, sign it as `origin`
/// and mint its id in the requested format.
pub fn seal(
    mut source: Value,
    keyring: &dyn Keyring,
    origin: &ServerName,
    format: IdFormat,
) -> KernelResult<Event> {
    let obj = source.as_object_mut().ok_or(KernelError::NotAnObject)?;
    obj.remove("event_id");
    obj.remove("signatures");
    obj.remove("hashes");
    let content_hash = hash::content_hash(&source);
    if let Some(obj) = source.as_object_mut() {
        obj.insert("hashes".into(), json!({ HASH_ALGORITHM: content_hash }));
    }

    let signature = keyring.sign(origin, &hash::signing_payload(&source))?;
    if let Some(obj) = source.as_object_mut() {
        obj.insert(
            "signatures".into(),
            json!({ origin.as_str(): { SIGNING_KEY_ID: signature } }),
        );
    }

    let id = match format {
        IdFormat::Hashed => hash::reference_id(&source),
        IdFormat::Legacy => {
            let reference = hash::reference_id(&source);
            let local: String = reference.as_str()[1..].chars().take(18).collect();
            EventId::parse(format!("${local}:{origin}"))?
        }
    };

    Event::with_id(source, id)
}

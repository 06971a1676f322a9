// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Response validation.
//!
//! A response must be well formed and its events must pass the enabled
//! checks before it resolves a request; a failing response counts as a
//! failed attempt and the request moves on to the next remote.

use super::{FetchOpts, Op};
use hsvm_kernel::verify::verify_event;
use hsvm_kernel::{Conforms, Event, IdFormat, Keyring, ServerName};
use serde_json::Value;

pub(crate) fn response(
    opts: &FetchOpts,
    remote: &ServerName,
    body: Value,
    keyring: &dyn Keyring,
) -> Result<Vec<Event>, String> {
    let field = match opts.op {
        Op::Auth => "auth_chain",
        Op::Event | Op::Backfill => "pdus",
    };
    let pdus = match body {
        Value::Object(mut obj) => match obj.remove(field) {
            Some(Value::Array(pdus)) => pdus,
            _ => return Err(format!("response has no {field} array")),
        },
        _ => return Err("response is not an object".into()),
    };

    let events = pdus
        .into_iter()
        .map(|pdu| Event::from_pdu(pdu).map_err(|e| format!("malformed pdu: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    if opts.op == Op::Event {
        let [event] = events.as_slice() else {
            return Err(format!("expected one pdu, got {}", events.len()));
        };
        if opts.check_event_id && event.event_id() != Some(&opts.event_id) {
            return Err(format!(
                "event id mismatch: asked for {}, got {}",
                opts.event_id,
                event.event_id().map(|id| id.as_str()).unwrap_or("<none>")
            ));
        }
    }

    for event in &events {
        check_event(opts, remote, event, keyring)?;
    }
    Ok(events)
}

fn check_event(opts: &FetchOpts, remote: &ServerName, event: &Event, keyring: &dyn Keyring) -> Result<(), String> {
    let id = event.event_id().map(|id| id.as_str()).unwrap_or("<none>");

    if opts.check_conforms {
        let mut tolerated = Conforms::empty();
        if !opts.check_hashes {
            tolerated |= Conforms::MISMATCH_HASHES;
        }
        // A redacted copy fails its content hash; only its origin may serve it.
        if opts.authoritative_redaction && event.origin() == Some(remote) {
            tolerated |= Conforms::MISMATCH_HASHES;
        }
        if !opts.check_event_id {
            tolerated |= Conforms::MISMATCH_EVENT_ID;
        }
        let report = Conforms::check(event).without(tolerated);
        if !report.clean() {
            return Err(format!("{id} does not conform: {report}"));
        }
    }

    if opts.check_signature {
        if let (Some(event_id), Some(origin)) = (event.event_id(), event.origin()) {
            if event_id.format() == IdFormat::Legacy && keyring.has_key(origin) {
                verify_event(keyring, event).map_err(|e| format!("{id} signature: {e}"))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use hsvm_kernel::types::id::IdFormat;
    use hsvm_kernel::verify::seal;
    use hsvm_persistence::fixtures;
    use serde_json::json;

    fn opts(op: Op, event: &Event) -> FetchOpts {
        FetchOpts::new(
            op,
            event.room_id().unwrap().clone(),
            event.event_id().unwrap().clone(),
            &FetchConfig::default(),
        )
    }

    fn remote() -> ServerName {
        ServerName::parse(fixtures::ORIGIN).unwrap()
    }

    #[test]
    fn test_event_response_accepted() {
        let events = fixtures::sample_room();
        let body = json!({ "origin": fixtures::ORIGIN, "pdus": [events[2].source()] });
        let got = response(&opts(Op::Event, &events[2]), &remote(), body, &fixtures::keyring()).unwrap();
        assert_eq!(got, vec![events[2].clone()]);
    }

    #[test]
    fn test_event_id_mismatch_rejected() {
        let events = fixtures::sample_room();
        let body = json!({ "pdus": [events[1].source()] });
        let err = response(&opts(Op::Event, &events[2]), &remote(), body, &fixtures::keyring()).unwrap_err();
        assert!(err.contains("mismatch"), "{err}");
    }

    #[test]
    fn test_redaction_only_from_origin() {
        let events = fixtures::sample_room();
        let mut tampered = events[2].source().clone();
        tampered["content"] = json!({ "body": "changed" });
        let body = || json!({ "pdus": [tampered.clone()] });
        let o = opts(Op::Backfill, &events[2]);

        // The record keeps its id but the content hash no longer matches.
        let other = ServerName::parse("other.test").unwrap();
        assert!(response(&o, &other, body(), &fixtures::keyring()).is_err());
        assert!(response(&o, &remote(), body(), &fixtures::keyring()).is_ok());
    }

    #[test]
    fn test_legacy_signature_checked_with_cached_key() {
        let keyring = fixtures::keyring();
        let mut source = fixtures::sample_room()[2].source().clone();
        source.as_object_mut().unwrap().remove("event_id");
        let event = seal(source, &keyring, &remote(), IdFormat::Legacy).unwrap();

        let mut forged = event.source().clone();
        forged["signatures"] = json!({ fixtures::ORIGIN: { "blake3:auto": "AAAA" } });
        let body = json!({ "pdus": [forged] });
        let err = response(&opts(Op::Event, &event), &remote(), body.clone(), &keyring).unwrap_err();
        assert!(err.contains("signature"), "{err}");

        // Without a cached key the signature is not checked.
        let empty = hsvm_kernel::LocalKeyring::new();
        assert!(response(&opts(Op::Event, &event), &remote(), body, &empty).is_ok());
    }

    #[test]
    fn test_auth_chain_field() {
        let events = fixtures::sample_room();
        let body = json!({ "auth_chain": [events[0].source(), events[1].source()] });
        let got = response(&opts(Op::Auth, &events[2]), &remote(), body, &fixtures::keyring()).unwrap();
        assert_eq!(got.len(), 2);
        assert!(response(&opts(Op::Auth, &events[2]), &remote(), json!({}), &fixtures::keyring()).is_err());
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EventResponse {
    pub origin: String,
    pub origin_server_ts: i64,
    pub pdus: Vec<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackfillResponse {
    pub origin: String,
    pub pdus: Vec<Value>,
}

#[derive(Deserialize, Debug)]
pub struct BackfillQuery {
    /// Event to backfill from.
    pub v: String,
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthChainResponse {
    pub auth_chain: Vec<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SendTransactionRequest {
    pub origin: String,
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default)]
    pub pdus: Vec<Value>,
    #[serde(default)]
    pub edus: Vec<Value>,
}

/// Outcome of one PDU; an empty object when accepted.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PduResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SendTransactionResponse {
    pub pdus: BTreeMap<String, PduResult>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SequenceResponse {
    pub retired: u64,
    pub committed: u64,
    pub uncommitted: u64,
    /// Evaluations in flight.
    pub live: usize,
    /// Fetch requests in flight.
    pub fetching: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InjectRequest {
    /// `room_id`, `type`, `sender` and optionally `state_key`.
    pub fields: Value,
    pub content: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InjectResponse {
    pub event_id: Option<String>,
    pub fault: String,
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::api::*;
use crate::errors::EngineError;
use crate::vm::{Copts, Fault, Opts, Vm};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use hsvm_kernel::{Event, EventId, RoomId, ServerName};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::trace::TraceLayer;

pub type SharedVm = Arc<Vm>;

/// Upper bound on events served by one backfill.
pub const BACKFILL_MAX: usize = 256;
const BACKFILL_DEFAULT: usize = 10;

pub fn build_router(vm: SharedVm) -> Router {
    Router::new()
        .route("/_matrix/federation/v1/event/:event_id", get(get_event))
        .route("/_matrix/federation/v1/backfill/:room_id", get(backfill))
        .route("/_matrix/federation/v1/event_auth/:room_id/:event_id", get(event_auth))
        .route("/_matrix/federation/v1/send/:txn_id", put(send_transaction))
        // Admin
        .route("/_hsvm/sequence", get(sequence))
        .route("/_hsvm/inject", post(inject))
        // Observability
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(vm)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

async fn get_event(
    State(vm): State<SharedVm>,
    Path(event_id): Path<String>,
) -> Result<Json<EventResponse>, EngineError> {
    let event_id = EventId::parse(event_id)?;
    let event = vm
        .store()
        .get_event(&event_id)?
        .ok_or_else(|| EngineError::NotFound(event_id.to_string()))?;

    Ok(Json(EventResponse {
        origin: vm.server_name().to_string(),
        origin_server_ts: now_ms(),
        pdus: vec![event.source().clone()],
    }))
}

async fn backfill(
    State(vm): State<SharedVm>,
    Path(room_id): Path<String>,
    Query(query): Query<BackfillQuery>,
) -> Result<Json<BackfillResponse>, EngineError> {
    let room_id = RoomId::parse(room_id)?;
    let from = EventId::parse(query.v)?;
    let limit = query.limit.unwrap_or(BACKFILL_DEFAULT).clamp(1, BACKFILL_MAX);

    if !vm.store().exists(&from) {
        return Err(EngineError::NotFound(from.to_string()));
    }
    let events = vm.store().backfill(&room_id, &from, limit)?;

    Ok(Json(BackfillResponse {
        origin: vm.server_name().to_string(),
        pdus: events.iter().map(|e| e.source().clone()).collect(),
    }))
}

async fn event_auth(
    State(vm): State<SharedVm>,
    Path((room_id, event_id)): Path<(String, String)>,
) -> Result<Json<AuthChainResponse>, EngineError> {
    let room_id = RoomId::parse(room_id)?;
    let event_id = EventId::parse(event_id)?;
    let event = vm
        .store()
        .get_event(&event_id)?
        .filter(|e| e.room_id() == Some(&room_id))
        .ok_or_else(|| EngineError::NotFound(event_id.to_string()))?;

    let chain = vm.store().auth_chain(&event_id)?;
    tracing::debug!("event_auth {} -> {} events", event.pretty_oneline(), chain.len());
    Ok(Json(AuthChainResponse {
        auth_chain: chain.iter().map(|e| e.source().clone()).collect(),
    }))
}

/// Evaluate a transaction pushed by a remote. PDUs are evaluated one at a
/// time in depth order, and each gets its own result.
async fn send_transaction(
    State(vm): State<SharedVm>,
    Path(txn_id): Path<String>,
    Json(txn): Json<SendTransactionRequest>,
) -> Result<Json<SendTransactionResponse>, EngineError> {
    let origin = ServerName::parse(txn.origin.as_str())?;
    tracing::info!(
        "txn {} from {}: {} pdus {} edus",
        txn_id,
        origin,
        txn.pdus.len(),
        txn.edus.len()
    );

    let mut results = BTreeMap::new();
    let mut events = Vec::with_capacity(txn.pdus.len());
    for pdu in txn.pdus {
        let id = pdu.get("event_id").and_then(|v| v.as_str()).map(str::to_string);
        match Event::from_pdu(pdu) {
            Ok(event) => events.push(event),
            Err(e) => {
                results.insert(
                    id.unwrap_or_else(|| "<unknown>".to_string()),
                    PduResult {
                        error: Some(e.to_string()),
                    },
                );
            }
        }
    }
    events.sort();

    for event in events {
        let id = event.event_id().map(ToString::to_string).unwrap_or_default();
        let opts = Opts {
            txn_id: Some(txn_id.clone()),
            ..Opts::from_remote(origin.clone())
        };
        let result = match vm.execute(vec![event], opts).await {
            Ok(Fault::Accept) | Ok(Fault::Exists) => PduResult::default(),
            Ok(code) => PduResult {
                error: Some(code.reflect().to_string()),
            },
            Err(e) => PduResult {
                error: Some(e.to_string()),
            },
        };
        results.insert(id, result);
    }

    if !txn.edus.is_empty() {
        let edus = txn
            .edus
            .into_iter()
            .filter_map(|edu| Event::from_json(edu).ok())
            .collect();
        let opts = Opts {
            edu: true,
            ..Opts::from_remote(origin)
        };
        if let Err(e) = vm.execute(edus, opts).await {
            tracing::warn!("txn {} edus: {}", txn_id, e);
        }
    }

    Ok(Json(SendTransactionResponse { pdus: results }))
}

async fn sequence(State(vm): State<SharedVm>) -> Json<SequenceResponse> {
    let c = vm.counters();
    Json(SequenceResponse {
        retired: c.retired,
        committed: c.committed,
        uncommitted: c.uncommitted,
        live: vm.live(),
        fetching: vm.fetcher().count(),
    })
}

async fn inject(
    State(vm): State<SharedVm>,
    Json(req): Json<InjectRequest>,
) -> Result<Json<InjectResponse>, EngineError> {
    let issued = vm.inject(req.fields, req.content, Copts::default()).await?;
    Ok(Json(InjectResponse {
        event_id: issued.event.event_id().map(ToString::to_string),
        fault: issued.fault.reflect().to_string(),
    }))
}

async fn metrics_handler() -> String {
    crate::telemetry::get_metrics()
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Federation transport.

pub mod client;

pub use client::FederationClient;

use async_trait::async_trait;
use hsvm_kernel::{EventId, RoomId, ServerName};
use serde_json::Value;
use thiserror::Error;

/// A request to a remote server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FedRequest {
    /// One event by id. Responds `{origin, origin_server_ts, pdus: [event]}`.
    Event { event_id: EventId },
    /// The auth chain of an event. Responds `{auth_chain: [..]}`.
    EventAuth { room_id: RoomId, event_id: EventId },
    /// Events preceding and including `event_id`. Responds `{pdus: [..]}`.
    Backfill {
        room_id: RoomId,
        event_id: EventId,
        limit: usize,
    },
}

impl FedRequest {
    pub fn name(&self) -> &'static str {
        match self {
            FedRequest::Event { .. } => "event",
            FedRequest::EventAuth { .. } => "event_auth",
            FedRequest::Backfill { .. } => "backfill",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route to {0}")]
    Unreachable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote answered {status}: {message}")]
    Http { status: u16, message: String },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("request timed out")]
    Timeout,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, remote: &ServerName, request: FedRequest) -> Result<Value, TransportError>;

    /// Whether `remote` is known to be failing and should not be tried.
    fn errant(&self, _remote: &ServerName) -> bool {
        false
    }
}

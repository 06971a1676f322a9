// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::{FedRequest, Transport, TransportError};
use async_trait::async_trait;
use hsvm_kernel::ServerName;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use serde_json::Value;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const FEDERATION_PREFIX: [&str; 3] = ["_matrix", "federation", "v1"];

#[derive(Debug)]
pub struct FederationClient {
    peers: BTreeMap<ServerName, String>,
    client: Client,
    backoff: Duration,
    errant: Mutex<FxHashMap<ServerName, Instant>>,
}

impl FederationClient {
    pub fn new(peers: BTreeMap<ServerName, String>, backoff: Duration) -> Self {
        Self {
            peers,
            client: Client::new(),
            backoff,
            errant: Mutex::new(FxHashMap::default()),
        }
    }

    /// Base URL of `remote`: its configured peer entry, else `https://name`.
    pub fn base_url(&self, remote: &ServerName) -> String {
        self.peers
            .get(remote)
            .cloned()
            .unwrap_or_else(|| format!("https://{}", remote))
    }

    pub fn url(&self, remote: &ServerName, request: &FedRequest) -> Result<Url, TransportError> {
        let base = self.base_url(remote);
        let mut url = Url::parse(&base).map_err(|e| TransportError::Unreachable(format!("{base}: {e}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| TransportError::Unreachable(base.clone()))?;
            path.pop_if_empty().extend(FEDERATION_PREFIX);
            match request {
                FedRequest::Event { event_id } => {
                    path.extend(["event", event_id.as_str()]);
                }
                FedRequest::EventAuth { room_id, event_id } => {
                    path.extend(["event_auth", room_id.as_str(), event_id.as_str()]);
                }
                FedRequest::Backfill { room_id, .. } => {
                    path.extend(["backfill", room_id.as_str()]);
                }
            }
        }
        if let FedRequest::Backfill { event_id, limit, .. } = request {
            url.query_pairs_mut()
                .append_pair("v", event_id.as_str())
                .append_pair("limit", &limit.to_string());
        }
        Ok(url)
    }

    fn mark_errant(&self, remote: &ServerName) {
        self.errant.lock().insert(remote.clone(), Instant::now() + self.backoff);
    }

    fn clear_errant(&self, remote: &ServerName) {
        self.errant.lock().remove(remote);
    }
}

#[async_trait]
impl Transport for FederationClient {
    async fn send(&self, remote: &ServerName, request: FedRequest) -> Result<Value, TransportError> {
        let url = self.url(remote, &request)?;
        tracing::debug!("federation {} -> {} {}", request.name(), remote, url);

        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.mark_errant(remote);
                return Err(TransportError::Network(e.to_string()));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            if status.is_server_error() {
                self.mark_errant(remote);
            }
            let message = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        self.clear_errant(remote);
        resp.json().await.map_err(|e| TransportError::Decode(e.to_string()))
    }

    fn errant(&self, remote: &ServerName) -> bool {
        let mut errant = self.errant.lock();
        match errant.get(remote) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                errant.remove(remote);
                false
            }
            None => false,
        }
    }
}

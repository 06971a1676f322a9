// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use hsvm_kernel::ServerName;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct FetchConfig {
    pub enable: bool,
    /// Default per-attempt timeout.
    pub timeout: Duration,
    pub timeout_event: Option<Duration>,
    pub timeout_auth: Option<Duration>,
    pub timeout_backfill: Option<Duration>,
    /// Outstanding requests before `start` parks.
    pub requests_max: usize,
    pub backfill_limit_default: usize,
    /// Remotes tried per request; zero is unlimited.
    pub attempt_limit: usize,
    pub check_event_id: bool,
    pub check_conforms: bool,
    pub check_hashes: bool,
    /// Accept a redacted copy of an event from its own origin.
    pub authoritative_redaction: bool,
    pub check_signature: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            enable: true,
            timeout: Duration::from_secs(5),
            timeout_event: None,
            timeout_auth: Some(Duration::from_secs(15)),
            timeout_backfill: None,
            requests_max: 2048,
            backfill_limit_default: 96,
            attempt_limit: 0,
            check_event_id: true,
            check_conforms: true,
            check_hashes: true,
            authoritative_redaction: true,
            check_signature: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Master switch for fetching missing dependencies during evaluation.
    pub fetch_enable: bool,
    pub fetch_auth_timeout: Duration,
    pub fetch_state_timeout: Duration,
    /// Deadline for racing prev fetches.
    pub fetch_event_timeout: Duration,
    pub fetch_prev_wait_count: usize,
    pub fetch_prev_wait_time: Duration,
    pub fetch_prev_check_interval: Duration,
    pub fetch_prev_backfill_limit: usize,
    pub inject_prev_limit: usize,
    pub log_commit_debug: bool,
    pub log_accept_debug: bool,
    pub log_accept_info: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            fetch_enable: true,
            fetch_auth_timeout: Duration::from_secs(15),
            fetch_state_timeout: Duration::from_secs(20),
            fetch_event_timeout: Duration::from_secs(10),
            fetch_prev_wait_count: 4,
            fetch_prev_wait_time: Duration::from_millis(200),
            fetch_prev_check_interval: Duration::from_millis(500),
            fetch_prev_backfill_limit: 128,
            inject_prev_limit: 16,
            log_commit_debug: true,
            log_accept_debug: false,
            log_accept_info: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub server_name: ServerName,
    pub bind_addr: SocketAddr,
    /// Durable store location; in-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Base URL of each known peer.
    pub peers: BTreeMap<ServerName, String>,
    /// Seed the signing keys are derived from; shared by a closed federation.
    pub key_seed: String,
    /// How long a failing remote is skipped.
    pub errant_backoff: Duration,
    pub fetch: FetchConfig,
    pub vm: VmConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8448)),
            data_dir: None,
            peers: BTreeMap::new(),
            key_seed: "hsvm".to_string(),
            errant_backoff: Duration::from_secs(30),
            fetch: FetchConfig::default(),
            vm: VmConfig::default(),
        }
    }
}

fn default_server_name() -> ServerName {
    ServerName::parse("localhost").unwrap_or_else(|_| unreachable!("constant is a valid server name"))
}

impl NodeConfig {
    pub fn with_server_name(mut self, name: ServerName) -> Self {
        self.server_name = name;
        self
    }

    /// Defaults overridden by `HSVM_*` environment variables. Malformed
    /// values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(name) = var("HSVM_SERVER_NAME") {
            match ServerName::parse(name.as_str()) {
                Ok(name) => cfg.server_name = name,
                Err(e) => tracing::warn!("HSVM_SERVER_NAME ignored: {}", e),
            }
        }
        if let Some(addr) = var("HSVM_BIND_ADDR") {
            match addr.parse() {
                Ok(addr) => cfg.bind_addr = addr,
                Err(e) => tracing::warn!("HSVM_BIND_ADDR ignored: {}", e),
            }
        }
        if let Some(dir) = var("HSVM_DATA_DIR").filter(|d| !d.is_empty()) {
            cfg.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(peers) = var("HSVM_PEERS") {
            cfg.peers = parse_peers(&peers);
        }
        if let Some(seed) = var("HSVM_KEY_SEED") {
            cfg.key_seed = seed;
        }
        if let Some(secs) = var("HSVM_FETCH_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            cfg.fetch.timeout = Duration::from_secs(secs);
        }
        if let Some(max) = var("HSVM_FETCH_REQUESTS_MAX").and_then(|s| s.parse().ok()) {
            cfg.fetch.requests_max = max;
        }
        cfg
    }
}

/// `name=url` pairs separated by commas.
fn parse_peers(list: &str) -> BTreeMap<ServerName, String> {
    list.split(',')
        .filter_map(|pair| {
            let (name, url) = pair.trim().split_once('=')?;
            match ServerName::parse(name.trim()) {
                Ok(name) => Some((name, url.trim().trim_end_matches('/').to_string())),
                Err(e) => {
                    tracing::warn!("peer {:?} ignored: {}", pair, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.fetch.requests_max, 2048);
        assert_eq!(cfg.fetch.backfill_limit_default, 96);
        assert_eq!(cfg.vm.fetch_prev_backfill_limit, 128);
        assert_eq!(cfg.vm.fetch_event_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("HSVM_SERVER_NAME", "a.test"),
            ("HSVM_PEERS", "b.test=http://127.0.0.1:9000/, c.test=http://c"),
            ("HSVM_FETCH_REQUESTS_MAX", "8"),
            ("HSVM_BIND_ADDR", "not an address"),
        ]);
        let cfg = NodeConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.server_name.as_str(), "a.test");
        assert_eq!(cfg.fetch.requests_max, 8);
        assert_eq!(cfg.bind_addr, NodeConfig::default().bind_addr);
        let b = ServerName::parse("b.test").unwrap();
        assert_eq!(cfg.peers.get(&b).map(String::as_str), Some("http://127.0.0.1:9000"));
        assert_eq!(cfg.peers.len(), 2);
    }
}

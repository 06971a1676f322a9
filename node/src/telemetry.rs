// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs + metrics)
pub fn init_telemetry() {
    // 1. Tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hsvm_node=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Prometheus
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROM_HANDLE.set(handle).is_err() {
                tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
            }
        }
        Err(e) => {
            tracing::error!("failed to install Prometheus recorder: {}", e);
            return;
        }
    }

    metrics::describe_counter!("hsvm_evals_accepted_total", "Events accepted by the VM");
    metrics::describe_counter!("hsvm_evals_faulted_total", "Evaluations ending in a fault, by fault");
    metrics::describe_counter!("hsvm_write_commit_total", "Transactions committed");
    metrics::describe_histogram!("hsvm_write_commit_duration_seconds", "Time taken to commit a transaction");
    metrics::describe_counter!("hsvm_fetch_requests_total", "Fetch requests started, by op");
    metrics::describe_counter!("hsvm_fetch_attempts_total", "Fetch attempts sent to remotes, by op");
    metrics::describe_gauge!("hsvm_fetch_inflight", "Fetch requests in flight");
    metrics::describe_gauge!("hsvm_sequence_retired", "Highest retired sequence number");

    metrics::gauge!("hsvm_node_up", 1.0);
}

/// Get the Prometheus handle to render metrics
pub fn get_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
